//! In-process publish/subscribe.
//!
//! # Dispatch policy
//!
//! ```text
//! publish(msg) ──► subscriber queue (FIFO, unbounded) ──► dispatcher task
//!              └─► subscriber queue ...                      │
//!                                                            ▼
//!                                    handler(msg) spawned, ≤ concurrency in flight
//! ```
//!
//! `publish` never waits for a handler. Each subscriber sees messages started
//! in the order they were published; with a concurrency of one it also sees
//! them finish in that order. Messages published while nobody is subscribed
//! are dropped.

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::config::BusConfig;
use crate::messages::{DatabaseUpdateMsg, ErrorEvent, JobMsg, RequestMsg, ResultMsg};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A typed fan-out channel.
pub struct Channel<T> {
    name: &'static str,
    concurrency: usize,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<Arc<T>>>>,
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("subscribers", &self.read().len())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Channel<T> {
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        Self {
            name,
            concurrency: concurrency.max(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register `handler` with the channel's default concurrency.
    ///
    /// Must be called from inside a Tokio runtime: the subscriber's
    /// dispatcher is spawned immediately.
    pub fn subscribe<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_with(self.concurrency, handler);
    }

    /// Register `handler` with at most `concurrency` invocations in flight.
    pub fn subscribe_with<F, Fut>(&self, concurrency: usize, handler: F)
    where
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(self.name, rx, handler, concurrency.max(1)));
        self.write().push(tx);
    }

    /// Hand `msg` to every current subscriber and return immediately.
    pub fn publish(&self, msg: T) {
        let msg = Arc::new(msg);
        let subscribers = self.read();
        if subscribers.is_empty() {
            debug!(channel = self.name, "publish without subscribers; message dropped");
            return;
        }
        for tx in subscribers.iter() {
            if tx.send(Arc::clone(&msg)).is_err() {
                debug!(channel = self.name, "subscriber dispatcher has stopped");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<mpsc::UnboundedSender<Arc<T>>>> {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<mpsc::UnboundedSender<Arc<T>>>> {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner())
    }
}

async fn dispatch<T, F, Fut>(
    channel: &'static str,
    mut rx: mpsc::UnboundedReceiver<Arc<T>>,
    handler: F,
    concurrency: usize,
) where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let limit = Arc::new(Semaphore::new(concurrency));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let fut = handler(msg);
                running.spawn(async move {
                    fut.await;
                    drop(permit);
                });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                report_join(channel, joined);
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        report_join(channel, joined);
    }
}

fn report_join(channel: &'static str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(channel, "subscriber panicked while handling a message");
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// The process-wide set of channels.
///
/// Built once at startup and shared as `Arc<Bus>` with every component that
/// publishes or subscribes.
#[derive(Debug)]
pub struct Bus {
    pub job: Channel<JobMsg>,
    pub result: Channel<ResultMsg>,
    pub request: Channel<RequestMsg>,
    pub database_update: Channel<DatabaseUpdateMsg>,
    /// Non-fatal failures surfaced for operators.
    pub errors: Channel<ErrorEvent>,
}

impl Bus {
    pub fn new(config: &BusConfig) -> Self {
        let n = config.dispatch_concurrency;
        Self {
            job: Channel::new("job", n),
            result: Channel::new("result", n),
            request: Channel::new("request", n),
            database_update: Channel::new("databaseupdate", n),
            errors: Channel::new("errors", n),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn recv_n<T>(rx: &mut mpsc::UnboundedReceiver<T>, n: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(v)) => out.push(v),
                Ok(None) => break,
                Err(_) => panic!("timed out after {} of {n} messages", out.len()),
            }
        }
        out
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_message_once() {
        let channel: Channel<u32> = Channel::new("test", 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for sub in 0..3u32 {
            let tx = tx.clone();
            channel.subscribe(move |msg: Arc<u32>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((sub, *msg));
                }
            });
        }

        channel.publish(10);
        channel.publish(20);

        let got: HashSet<(u32, u32)> = recv_n(&mut rx, 6).await.into_iter().collect();
        let want: HashSet<(u32, u32)> = (0..3)
            .flat_map(|s| [(s, 10), (s, 20)])
            .collect();
        assert_eq!(got, want);

        // Nothing beyond the six deliveries.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_publishers_lose_nothing() {
        let channel: Arc<Channel<usize>> = Arc::new(Channel::new("test", 8));
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(move |msg: Arc<usize>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(*msg);
            }
        });

        let mut publishers = JoinSet::new();
        for n in 0..100usize {
            let channel = Arc::clone(&channel);
            publishers.spawn(async move { channel.publish(n) });
        }
        while publishers.join_next().await.is_some() {}

        let got: HashSet<usize> = recv_n(&mut rx, 100).await.into_iter().collect();
        assert_eq!(got, (0..100).collect::<HashSet<_>>());
    }

    #[tokio::test]
    async fn messages_without_subscribers_are_dropped() {
        let channel: Channel<&'static str> = Channel::new("test", 1);
        channel.publish("lost");

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(move |msg: Arc<&'static str>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(*msg);
            }
        });
        channel.publish("kept");

        assert_eq!(recv_n(&mut rx, 1).await, vec!["kept"]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_affect_others() {
        let channel: Channel<u32> = Channel::new("test", 2);
        channel.subscribe(|msg: Arc<u32>| async move {
            if *msg == 1 {
                panic!("handler failure");
            }
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(move |msg: Arc<u32>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(*msg);
            }
        });

        channel.publish(1);
        channel.publish(2);

        let got: HashSet<u32> = recv_n(&mut rx, 2).await.into_iter().collect();
        assert_eq!(got, HashSet::from([1, 2]));
    }

    #[tokio::test]
    async fn single_concurrency_preserves_publish_order() {
        let channel: Channel<u32> = Channel::new("test", 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(move |msg: Arc<u32>| {
            let tx = tx.clone();
            async move {
                // Earlier messages sleep longer; order must still hold.
                tokio::time::sleep(Duration::from_millis(u64::from(20 - *msg))).await;
                let _ = tx.send(*msg);
            }
        });

        for n in 0..20 {
            channel.publish(n);
        }
        assert_eq!(recv_n(&mut rx, 20).await, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let channel: Channel<u32> = Channel::new("test", 3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            channel.subscribe(move |_msg: Arc<u32>| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                let tx = tx.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = tx.send(());
                }
            });
        }

        for n in 0..12 {
            channel.publish(n);
        }
        recv_n(&mut rx, 12).await;
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded limit");
        assert!(peak > 1, "handlers never overlapped");
    }

    #[tokio::test]
    async fn bus_channels_are_independent() {
        let bus = Bus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.request.subscribe(move |msg: Arc<RequestMsg>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.function.clone());
            }
        });

        assert_eq!(bus.request.subscriber_count(), 1);
        assert_eq!(bus.job.subscriber_count(), 0);

        bus.request.publish(RequestMsg {
            ids: vec!["tickets/1".into()],
            function: "GetTicket".into(),
            user: "bob".into(),
        });
        assert_eq!(recv_n(&mut rx, 1).await, vec!["GetTicket".to_string()]);
    }
}
