use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, WatchEvent, WatchParams,
};
use kube::Client;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{EventKind, FeedMessage, MembershipFeed};
use crate::error::FeedError;

/// Buffered messages per subscription.
const FEED_BUFFER: usize = 128;

type WatchStream = BoxStream<'static, kube::Result<WatchEvent<DynamicObject>>>;

/// Membership feed backed by the cluster's Node objects.
///
/// Each subscription lists all nodes and then watches from the listed
/// resource version, so a resubscribe always starts with a full resync.
pub struct KubeFeed {
    api: Api<DynamicObject>,
}

impl KubeFeed {
    /// Connects using the in-cluster or kubeconfig credentials.
    pub async fn connect() -> Result<Self, FeedError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Node"));
        Self {
            api: Api::all_with(client, &resource),
        }
    }
}

#[async_trait]
impl MembershipFeed for KubeFeed {
    async fn subscribe(&self) -> Result<mpsc::Receiver<FeedMessage>, FeedError> {
        let list = self.api.list(&ListParams::default()).await?;
        let version = list
            .metadata
            .resource_version
            .clone()
            .unwrap_or_else(|| "0".to_string());

        let mut snapshot = Vec::with_capacity(list.items.len());
        for node in &list.items {
            if let Some(value) = to_payload(node) {
                snapshot.push(value);
            }
        }
        info!("Listed {} nodes at version {}", snapshot.len(), version);

        let stream = self
            .api
            .watch(&WatchParams::default(), &version)
            .await?
            .boxed();

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        tokio::spawn(forward(snapshot, stream, tx));
        Ok(rx)
    }
}

/// Pumps one watch into a subscription channel. Dropping `tx` on return
/// closes the subscription.
async fn forward(snapshot: Vec<Value>, mut stream: WatchStream, tx: mpsc::Sender<FeedMessage>) {
    if tx.send(FeedMessage::Resync(snapshot)).await.is_err() {
        return;
    }

    while let Some(item) = stream.next().await {
        let (kind, node) = match item {
            Ok(WatchEvent::Added(node)) => (EventKind::Added, node),
            Ok(WatchEvent::Modified(node)) => (EventKind::Modified, node),
            Ok(WatchEvent::Deleted(node)) => (EventKind::Deleted, node),
            Ok(WatchEvent::Bookmark(_)) => continue,
            Ok(WatchEvent::Error(e)) => {
                warn!("Node watch returned an error: {}", e);
                break;
            }
            Err(e) => {
                error!("Error in node watch stream: {}", e);
                break;
            }
        };
        let Some(object) = to_payload(&node) else {
            continue;
        };
        if tx.send(FeedMessage::Event { kind, object }).await.is_err() {
            debug!("Subscriber went away, stopping node watch");
            return;
        }
    }
    warn!("Node watch stream ended");
}

fn to_payload(node: &DynamicObject) -> Option<Value> {
    match serde_json::to_value(node) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Failed to serialize node object: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn watch_event(value: Value) -> kube::Result<WatchEvent<DynamicObject>> {
        Ok(serde_json::from_value(value).unwrap())
    }

    fn node_event(kind: &str, name: &str) -> kube::Result<WatchEvent<DynamicObject>> {
        watch_event(json!({
            "type": kind,
            "object": { "apiVersion": "v1", "kind": "Node", "metadata": { "name": name } }
        }))
    }

    fn bookmark() -> kube::Result<WatchEvent<DynamicObject>> {
        watch_event(json!({
            "type": "BOOKMARK",
            "object": { "apiVersion": "v1", "kind": "Node", "metadata": { "resourceVersion": "42" } }
        }))
    }

    fn expired() -> kube::Result<WatchEvent<DynamicObject>> {
        watch_event(json!({
            "type": "ERROR",
            "object": {
                "status": "Failure",
                "message": "too old resource version",
                "reason": "Expired",
                "code": 410
            }
        }))
    }

    /// Runs `forward` to completion and returns everything it sent.
    async fn forwarded(
        snapshot: Vec<Value>,
        events: Vec<kube::Result<WatchEvent<DynamicObject>>>,
    ) -> Vec<FeedMessage> {
        let (tx, mut rx) = mpsc::channel(events.len() + 1);
        forward(snapshot, stream::iter(events).boxed(), tx).await;
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        messages
    }

    fn event_names(messages: &[FeedMessage]) -> Vec<(EventKind, String)> {
        messages
            .iter()
            .filter_map(|message| match message {
                FeedMessage::Event { kind, object } => Some((
                    *kind,
                    object["metadata"]["name"].as_str().unwrap_or_default().to_string(),
                )),
                FeedMessage::Resync(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn resync_comes_first_and_bookmarks_are_skipped() {
        let snapshot = vec![json!({ "metadata": { "name": "w1" } })];
        let messages = forwarded(
            snapshot,
            vec![
                node_event("ADDED", "w2"),
                bookmark(),
                node_event("MODIFIED", "w1"),
                node_event("DELETED", "w2"),
            ],
        )
        .await;

        let FeedMessage::Resync(listed) = &messages[0] else {
            panic!("expected resync first");
        };
        assert_eq!(listed.len(), 1);
        assert_eq!(
            event_names(&messages),
            vec![
                (EventKind::Added, "w2".to_string()),
                (EventKind::Modified, "w1".to_string()),
                (EventKind::Deleted, "w2".to_string()),
            ]
        );
        assert_eq!(messages.len(), 4);
    }

    #[tokio::test]
    async fn error_event_ends_the_subscription() {
        let messages = forwarded(
            Vec::new(),
            vec![node_event("ADDED", "w1"), expired(), node_event("ADDED", "w2")],
        )
        .await;

        assert!(matches!(messages[0], FeedMessage::Resync(ref listed) if listed.is_empty()));
        assert_eq!(event_names(&messages), vec![(EventKind::Added, "w1".to_string())]);
    }

    #[tokio::test]
    async fn stream_error_ends_the_subscription() {
        let broken = serde_json::from_str::<Value>("{").unwrap_err();
        let messages = forwarded(
            Vec::new(),
            vec![
                node_event("ADDED", "w1"),
                Err(kube::Error::SerdeError(broken)),
                node_event("ADDED", "w2"),
            ],
        )
        .await;

        assert_eq!(event_names(&messages), vec![(EventKind::Added, "w1".to_string())]);
    }

    #[tokio::test]
    async fn closed_subscriber_stops_the_watch() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        forward(Vec::new(), stream::iter(vec![node_event("ADDED", "w1")]).boxed(), tx).await;
    }
}
