//! # Example: Heartbeat
//!
//! A `clock` server and a client on an in-process broker:
//! - the client learns the alive period and calls `now` / `add`
//! - a slow call suspends the heartbeat until it returns
//! - the broker goes offline and comes back; both roles re-register
//! - the server stops; the client declares it lost
//!
//! Every bus event is rendered by [`LogWriter`] and fed to a [`ConnectionTracker`].
//!
//! ## Run
//! ```bash
//! RUST_LOG=info cargo run --example heartbeat --features logging
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use servicevisor::{
    ConnectionTracker, LogWriter, MemoryBroker, Service, ServiceConfig, ServiceImpl, ServiceStub,
    Subscribe, SubscriberSet,
};
use tracing_subscriber::EnvFilter;

fn clock_server(broker: &Arc<MemoryBroker>, config: &ServiceConfig) -> anyhow::Result<ServiceImpl> {
    let server = ServiceImpl::new("clock", broker.clone(), config.clone());
    server.register_call("now", |(): ()| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
    })?;
    server.register_call("add", |(a, b): (i64, i64)| a.checked_add(b).ok_or("overflow"))?;
    server.register_call("slow", |(ms,): (u64,)| {
        thread::sleep(Duration::from_millis(ms));
        Ok::<_, String>(ms)
    })?;
    Ok(server)
}

fn scenario(broker: &MemoryBroker, server: &ServiceImpl, client: &ServiceStub) -> anyhow::Result<()> {
    server.connect_default()?;
    server.run_async()?;
    client.connect_default()?;
    println!("[main] alive period learned: {:?}", client.alive_period());

    let now: u64 = client.invoke("now", &())?;
    println!("[main] server time: {now} ms");
    let sum: i64 = client.invoke("add", &(40, 2))?;
    println!("[main] 40 + 2 = {sum}");
    if let Err(e) = client.invoke::<i64, _>("add", &(i64::MAX, 1)) {
        println!("[main] add overflow rejected: {e}");
    }

    let slept: u64 = client.invoke("slow", &(150u64,))?;
    println!("[main] slow call returned after {slept} ms");

    println!("[main] broker offline");
    broker.set_online(false);
    thread::sleep(Duration::from_millis(200));
    println!("[main] broker online");
    broker.set_online(true);
    thread::sleep(Duration::from_millis(300));
    println!("[main] client connected: {}", client.is_connected());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = Arc::new(MemoryBroker::new());
    let config = ServiceConfig {
        alive_period: Duration::from_millis(100),
        call_timeout: Duration::from_secs(1),
        ..ServiceConfig::default()
    };

    let tracker = Arc::new(ConnectionTracker::new());
    let subscribers: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter), tracker.clone()];
    let set = Arc::new(SubscriberSet::new(subscribers));

    let server = clock_server(&broker, &config)?;
    let client = ServiceStub::new("clock", broker.clone(), config);
    let listeners = [
        Arc::clone(&set).listen(server.bus()),
        Arc::clone(&set).listen(client.bus()),
    ];

    let (server, client) = tokio::task::spawn_blocking(move || {
        scenario(&broker, &server, &client).map(|()| (server, client))
    })
    .await??;
    println!("[main] connected services: {:?}", tracker.snapshot().await);

    println!("[main] stopping server");
    tokio::task::spawn_blocking(move || drop(server)).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    println!("[main] client connected: {}", client.is_connected());
    println!("[main] connected services: {:?}", tracker.snapshot().await);

    tokio::task::spawn_blocking(move || drop(client)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    for listener in listeners {
        listener.abort();
    }
    println!("[main] finished");
    Ok(())
}
