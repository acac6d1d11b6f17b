// Subscription-style consumers.
// An observer keeps a QueryState for one (descriptor, params) pair current:
// it fetches on mount, refetches when its key is invalidated or when asked to,
// and adopts values other consumers store for its key.

use crate::cache::CacheEvent;
use crate::descriptor::{Params, ResourceDescriptor, ResourceKey};
use crate::error::QueryError;
use crate::executor::{QueryClient, QueryOptions};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct QueryState<R> {
    pub value: Option<Arc<R>>,
    pub loading: bool,
    pub error: Option<QueryError>,
}

impl<R> QueryState<R> {
    pub fn loading() -> Self {
        Self {
            value: None,
            loading: true,
            error: None,
        }
    }

    pub fn ready(value: Arc<R>) -> Self {
        Self {
            value: Some(value),
            loading: false,
            error: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        !self.loading
    }
}

impl<R> Clone for QueryState<R> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            loading: self.loading,
            error: self.error.clone(),
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for QueryState<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("value", &self.value)
            .field("loading", &self.loading)
            .field("error", &self.error)
            .finish()
    }
}

/// Handle to a live query. Dropping it unsubscribes; a fetch it started keeps
/// running for the other consumers of the key.
pub struct QueryObserver<R> {
    key: ResourceKey,
    state: watch::Receiver<QueryState<R>>,
    refetch: Arc<Notify>,
    task: JoinHandle<()>,
}

impl<R> QueryObserver<R> {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn state(&self) -> QueryState<R> {
        self.state.borrow().clone()
    }

    /// Waits until the state is no longer loading.
    pub async fn settled(&mut self) -> QueryState<R> {
        let settled = self
            .state
            .wait_for(QueryState::is_settled)
            .await
            .map(|state| state.clone());
        settled.unwrap_or_else(|_| self.state.borrow().clone())
    }

    /// Waits for the next change, then until it settles.
    pub async fn next_settled(&mut self) -> QueryState<R> {
        if self.state.changed().await.is_err() {
            return self.state.borrow().clone();
        }
        self.settled().await
    }

    // Forced refetch, e.g. a manual retry after an error
    pub fn refetch(&self) {
        self.refetch.notify_one();
    }

    pub fn unsubscribe(self) {}
}

impl<R> Drop for QueryObserver<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl QueryClient {
    pub fn observe<R>(&self, descriptor: &ResourceDescriptor<R>, params: Params) -> QueryObserver<R>
    where
        R: DeserializeOwned + Send + Sync + 'static,
    {
        let key = descriptor.build_key(&params);
        let (state_tx, state_rx) = watch::channel(QueryState::loading());
        let refetch = Arc::new(Notify::new());
        // Subscribe before the first fetch so no event is missed
        let events = self.cache().subscribe();

        let task = tokio::spawn(run_observer(
            self.clone(),
            descriptor.clone(),
            params,
            key.clone(),
            state_tx,
            events,
            Arc::clone(&refetch),
        ));

        QueryObserver {
            key,
            state: state_rx,
            refetch,
            task,
        }
    }
}

enum Trigger {
    Invalidated,
    Manual,
}

async fn run_observer<R>(
    client: QueryClient,
    descriptor: ResourceDescriptor<R>,
    params: Params,
    key: ResourceKey,
    state: watch::Sender<QueryState<R>>,
    mut events: broadcast::Receiver<CacheEvent>,
    refetch: Arc<Notify>,
) where
    R: DeserializeOwned + Send + Sync + 'static,
{
    let mut options = QueryOptions::default();
    let mut delivered: Option<Arc<R>> = None;

    loop {
        // A new attempt clears the old error but keeps the last good value
        state.send_modify(|current| {
            current.loading = true;
            current.error = None;
        });

        match client.query_with(&descriptor, &params, options).await {
            Ok(value) => {
                delivered = Some(Arc::clone(&value));
                state.send_replace(QueryState::ready(value));
            }
            Err(error) => {
                debug!(key = %key, error = %error, "observed query failed");
                // Keep the last good value next to the error
                state.send_modify(|current| {
                    current.loading = false;
                    current.error = Some(error);
                });
            }
        }

        let trigger = loop {
            tokio::select! {
                _ = refetch.notified() => break Trigger::Manual,
                event = events.recv() => match event {
                    Ok(CacheEvent::Invalidated(invalidated)) if invalidated == key => {
                        break Trigger::Invalidated;
                    }
                    Ok(CacheEvent::Updated(updated)) if updated == key => {
                        let Some(value) = client.cache().get(&key).and_then(|entry| entry.downcast::<R>()) else {
                            continue;
                        };
                        let is_new = delivered
                            .as_ref()
                            .map_or(true, |previous| !Arc::ptr_eq(previous, &value));
                        if is_new {
                            delivered = Some(Arc::clone(&value));
                            state.send_replace(QueryState::ready(value));
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed events may include an invalidation of our key
                        warn!(key = %key, skipped, "observer lagged behind cache events");
                        break Trigger::Invalidated;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        };

        options = QueryOptions {
            force_refetch: matches!(trigger, Trigger::Manual),
            ..QueryOptions::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock_transport::{MockReply, MockTransport};
    use crate::transport::Transport;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Venue {
        id: u32,
        name: String,
    }

    fn venues() -> ResourceDescriptor<Vec<Venue>> {
        ResourceDescriptor::get("venues", "venues/{city}").freshness(Duration::from_secs(300))
    }

    fn lagos() -> Params {
        Params::new().with("city", "lagos")
    }

    fn client(transport: &Arc<MockTransport>) -> QueryClient {
        let transport: Arc<dyn Transport> = transport.clone();
        QueryClient::with_transport(ClientConfig::default(), transport).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_loads_then_settles() {
        let transport = Arc::new(
            MockTransport::new()
                .always(MockReply::Json(200, json!([{"id": 1, "name": "Terra Kulture"}])))
                .with_delay(Duration::from_millis(20)),
        );
        let client = client(&transport);

        let mut observer = client.observe(&venues(), lagos());
        assert!(observer.state().loading);
        assert!(observer.state().value.is_none());

        let state = observer.settled().await;
        assert!(!state.loading);
        assert!(state.error.is_none());
        assert_eq!(state.value.unwrap()[0].name, "Terra Kulture");
        assert_eq!(observer.key().to_string(), "venues/lagos");
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_refetches_on_invalidation() {
        let transport = Arc::new(
            MockTransport::new().always(MockReply::Json(200, json!([{"id": 2, "name": "Eko Hall"}]))),
        );
        transport.push_reply(MockReply::Json(200, json!([{"id": 1, "name": "Terra Kulture"}])));
        let client = client(&transport);

        let mut observer = client.observe(&venues(), lagos());
        let first = observer.settled().await;
        assert_eq!(first.value.unwrap()[0].id, 1);

        client.invalidate(&venues(), &lagos());
        let second = observer.next_settled().await;
        assert_eq!(second.value.unwrap()[0].id, 2);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_adopts_values_from_other_consumers() {
        let transport = Arc::new(
            MockTransport::new().always(MockReply::Json(200, json!([{"id": 3, "name": "Muson"}]))),
        );
        transport.push_reply(MockReply::Json(200, json!([{"id": 1, "name": "Terra Kulture"}])));
        let client = client(&transport);

        let mut observer = client.observe(&venues(), lagos());
        observer.settled().await;

        // Another screen forces a refetch of the same key
        let refreshed = client.refetch(&venues(), &lagos()).await.unwrap();
        let state = observer.next_settled().await;
        assert!(Arc::ptr_eq(&state.value.unwrap(), &refreshed));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_error_then_manual_retry() {
        let transport = Arc::new(
            MockTransport::new().always(MockReply::Json(200, json!([{"id": 1, "name": "Terra Kulture"}]))),
        );
        transport.push_reply(MockReply::Json(500, json!({"message": "Try again"})));
        let client = client(&transport);

        let mut observer = client.observe(&venues(), lagos());
        let failed = observer.settled().await;
        assert!(failed.value.is_none());
        assert_eq!(failed.error.unwrap().status(), Some(500));

        observer.refetch();
        let recovered = observer.next_settled().await;
        assert!(recovered.error.is_none());
        assert_eq!(recovered.value.unwrap().len(), 1);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_clears_error_while_loading() {
        let transport = Arc::new(
            MockTransport::new()
                .always(MockReply::Json(200, json!([{"id": 1, "name": "Terra Kulture"}])))
                .with_delay(Duration::from_millis(50)),
        );
        transport.push_reply(MockReply::Json(500, json!({"message": "Try again"})));
        let client = client(&transport);

        let mut observer = client.observe(&venues(), lagos());
        assert!(observer.settled().await.error.is_some());

        observer.refetch();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let retrying = observer.state();
        assert!(retrying.loading);
        assert!(retrying.error.is_none());

        let recovered = observer.next_settled().await;
        assert!(recovered.error.is_none());
        assert_eq!(recovered.value.unwrap()[0].id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_keeps_last_good_value() {
        let transport = Arc::new(
            MockTransport::new()
                .always(MockReply::Json(200, json!([{"id": 2, "name": "Eko Hall"}])))
                .with_delay(Duration::from_millis(50)),
        );
        transport.push_reply(MockReply::Json(200, json!([{"id": 1, "name": "Terra Kulture"}])));
        let client = client(&transport);

        let mut observer = client.observe(&venues(), lagos());
        observer.settled().await;

        client.invalidate(&venues(), &lagos());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let reloading = observer.state();
        assert!(reloading.loading);
        assert_eq!(reloading.value.unwrap()[0].id, 1);

        let reloaded = observer.next_settled().await;
        assert_eq!(reloaded.value.unwrap()[0].id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_keeps_shared_fetch_running() {
        let transport = Arc::new(
            MockTransport::new()
                .always(MockReply::Json(200, json!([{"id": 1, "name": "Terra Kulture"}])))
                .with_delay(Duration::from_millis(100)),
        );
        let client = client(&transport);

        let observer = client.observe(&venues(), lagos());
        // Let the observer start its fetch
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.cache().is_in_flight(observer.key()));
        observer.unsubscribe();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.cached(&venues(), &lagos()).is_some());
        assert_eq!(transport.calls(), 1);
    }
}
