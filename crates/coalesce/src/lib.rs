use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

// Result broadcast to every caller of a window. Values and errors fan out
// as Arcs so that `V` and `E` need not implement Clone.
type CallResult<V, E> = Result<Arc<V>, Arc<E>>;

/// Error returned by a coalesced call.
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    /// The window's producer failed. Every caller of the window observes
    /// the same underlying error.
    #[error("{0}")]
    Producer(Arc<E>),
    /// The initiating call was dropped before its producer completed,
    /// tearing down the window.
    #[error("initiating call was dropped before it completed")]
    InitiatorDropped,
}

/// Outcome of one [`Group::run`] call.
#[derive(Debug)]
pub struct Outcome<V, E> {
    /// The window's shared value or error.
    pub result: Result<Arc<V>, Error<E>>,
    /// Whether this caller joined a window initiated by another caller
    /// (`true`), or initiated the window itself (`false`).
    pub shared: bool,
}

/// Group coalesces concurrent calls which share a key into a single
/// execution of an expensive producer, fanning the produced value or error
/// out to every caller which arrives while that execution is in flight.
///
/// Group deduplicates only within the window of an in-flight execution.
/// It is not a cache: the entry for a key is removed the moment its result
/// is delivered, and a later call for the key runs its producer afresh.
pub struct Group<K, V, E> {
    flights: Mutex<HashMap<K, broadcast::Sender<CallResult<V, E>>>>,
}

impl<K, V, E> Group<K, V, E>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Number of keys having an execution currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().unwrap().len()
    }

    /// Run `producer` under `key`, or join an execution of it already in
    /// flight.
    ///
    /// If no call for `key` is outstanding this caller initiates a window:
    /// it runs `producer` to completion and resolves with its result and
    /// `shared == false`. Every other call for `key` which begins before
    /// that producer completes joins the window instead, suspending until
    /// the result is broadcast and resolving with it and `shared == true`.
    /// Once the result is delivered the window is forgotten, and the next
    /// call for `key` initiates a new one.
    ///
    /// The registry lock is held only for bookkeeping, never while the
    /// producer is pending, so windows of distinct keys proceed
    /// independently. A producer must not re-enter `run` for its own key:
    /// it would join the very window it is responsible for completing, and
    /// deadlock.
    ///
    /// Dropping a joining call detaches it without affecting the window.
    /// Dropping the initiating call drops its producer, tears the window
    /// down, and resolves current joiners with [`Error::InitiatorDropped`].
    pub async fn run<F, Fut>(&self, key: K, producer: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        // Join the window already open under `key`, or open a new one.
        let rx = {
            let mut flights = self.flights.lock().unwrap();

            match flights.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    flights.insert(key.clone(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = rx {
            let result = match rx.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Error::Producer(err)),
                // The channel closed without a broadcast: the initiator
                // was dropped and its window torn down.
                Err(_) => Err(Error::InitiatorDropped),
            };
            return Outcome {
                result,
                shared: true,
            };
        }

        // We initiated the window and are responsible for retiring it,
        // even if we're dropped while the producer is still pending.
        let flight = Flight {
            group: self,
            key: Some(key),
        };
        let result = match producer().await {
            Ok(value) => Ok(Arc::new(value)),
            Err(err) => Err(Arc::new(err)),
        };
        flight.complete(result.clone());

        Outcome {
            result: result.map_err(Error::Producer),
            shared: false,
        }
    }
}

impl<K, V, E> Default for Group<K, V, E>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

// The initiating caller's handle on its open window. Dropping it without
// completing removes the registry entry, which closes the broadcast channel
// and resolves current joiners with Error::InitiatorDropped.
struct Flight<'g, K, V, E>
where
    K: Eq + Hash,
{
    group: &'g Group<K, V, E>,
    key: Option<K>,
}

impl<K, V, E> Flight<'_, K, V, E>
where
    K: Eq + Hash,
{
    // Broadcast `result` and retire the window. Removal and send happen
    // under one lock hold: once a later call can observe the key as absent,
    // every joiner of this window is already guaranteed its result.
    fn complete(mut self, result: CallResult<V, E>) {
        let mut flights = self.group.flights.lock().unwrap();
        if let Some(tx) = self.key.take().and_then(|key| flights.remove(&key)) {
            // A send error means the window had no joiners to notify.
            let _ = tx.send(result);
        }
    }
}

impl<K, V, E> Drop for Flight<'_, K, V, E>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // A key still held here means the initiating call was dropped
        // mid-producer. Remove the entry so the channel closes and current
        // joiners resolve, and so the next caller starts a fresh window.
        let Some(key) = self.key.take() else { return };
        if let Ok(mut flights) = self.group.flights.lock() {
            flights.remove(&key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_lone_call_runs_producer() {
        let group: Group<&'static str, u64, anyhow::Error> = Group::new();

        let outcome = group.run("sku-42", || async { Ok(42) }).await;

        assert_eq!(*outcome.result.unwrap(), 42);
        assert!(!outcome.shared);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_coalesce() {
        let group: Arc<Group<&'static str, u64, anyhow::Error>> = Arc::new(Group::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut calls = Vec::new();
        for _ in 0..10 {
            let (group, runs) = (group.clone(), runs.clone());
            calls.push(tokio::spawn(async move {
                group
                    .run("sku-42", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Ok(7)
                    })
                    .await
            }));
        }
        let outcomes: Vec<_> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|handle| handle.unwrap())
            .collect();

        // One producer execution served all ten calls, and exactly one of
        // them (the initiator) reports the result as its own.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.shared).count(), 1);

        let first = outcomes[0].result.as_ref().unwrap();
        for outcome in &outcomes {
            let value = outcome.result.as_ref().unwrap();
            assert_eq!(**value, 7);
            assert!(Arc::ptr_eq(value, first));
        }
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let group: Group<String, &'static str, anyhow::Error> = Group::new();
        let runs = AtomicUsize::new(0);
        let runs = &runs;

        // The empty string is an ordinary key, distinct from "sku-1".
        let (a, b) = tokio::join!(
            group.run(String::new(), || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("for-empty")
            }),
            group.run("sku-1".to_string(), || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("for-sku-1")
            }),
        );

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(*a.result.unwrap(), "for-empty");
        assert_eq!(*b.result.unwrap(), "for-sku-1");
        assert!(!a.shared && !b.shared);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_sequential_calls_run_twice() {
        let group: Group<&'static str, u64, anyhow::Error> = Group::new();
        let runs = AtomicUsize::new(0);
        let runs = &runs;

        // Windows don't outlive their delivery: a call issued after the
        // prior window completed runs the producer again.
        for expect in 1..=2 {
            let outcome = group
                .run("sku-42", || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(9)
                })
                .await;

            assert_eq!(*outcome.result.unwrap(), 9);
            assert!(!outcome.shared);
            assert_eq!(runs.load(Ordering::SeqCst), expect);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_fans_out_without_poisoning() {
        let group: Arc<Group<&'static str, u64, anyhow::Error>> = Arc::new(Group::new());

        let mut calls = Vec::new();
        for _ in 0..5 {
            let group = group.clone();
            calls.push(tokio::spawn(async move {
                group
                    .run("sku-42", || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(anyhow::anyhow!("vendor unavailable"))
                    })
                    .await
            }));
        }
        let errs: Vec<Arc<anyhow::Error>> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|handle| match handle.unwrap() {
                Outcome {
                    result: Err(Error::Producer(err)),
                    ..
                } => err,
                other => panic!("expected a producer error, got {other:?}"),
            })
            .collect();

        // All five calls observe the one failure.
        for err in &errs {
            assert_eq!(err.to_string(), "vendor unavailable");
            assert!(Arc::ptr_eq(err, &errs[0]));
        }

        // The failure doesn't poison the key: the next call runs afresh.
        let outcome = group.run("sku-42", || async { Ok(3) }).await;
        assert_eq!(*outcome.result.unwrap(), 3);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_initiator_fails_joiners() {
        let group: Arc<Group<&'static str, u64, anyhow::Error>> = Arc::new(Group::new());

        let initiator = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("sku-42", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(group.in_flight(), 1);

        let joiner = {
            let group = group.clone();
            tokio::spawn(async move { group.run("sku-42", || async { Ok(2) }).await })
        };
        tokio::task::yield_now().await;
        initiator.abort();

        let outcome = joiner.await.unwrap();
        assert!(matches!(outcome.result, Err(Error::InitiatorDropped)));
        assert!(outcome.shared);

        // The abandoned window released its key for the next caller.
        assert_eq!(group.in_flight(), 0);
        let outcome = group.run("sku-42", || async { Ok(3) }).await;
        assert_eq!(*outcome.result.unwrap(), 3);
        assert!(!outcome.shared);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_joiner_leaves_window_intact() {
        let group: Arc<Group<&'static str, u64, anyhow::Error>> = Arc::new(Group::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let initiator = {
            let (group, runs) = (group.clone(), runs.clone());
            tokio::spawn(async move {
                group
                    .run("sku-42", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(5)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let joiner = {
            let (group, runs) = (group.clone(), runs.clone());
            tokio::spawn(async move {
                group
                    .run("sku-42", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(0)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        joiner.abort();

        let outcome = initiator.await.unwrap();
        assert_eq!(*outcome.result.unwrap(), 5);
        assert!(!outcome.shared);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }
}
