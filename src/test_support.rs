//! Helpers shared by the in-crate tests: an in-process broker on an
//! ephemeral port and a polling wait.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::broker::Broker;
use crate::transport::{bind, start_websocket_server};

/// Starts a broker on `127.0.0.1:0` and returns its `host:port`.
pub(crate) async fn spawn_broker() -> (String, Arc<Mutex<Broker>>) {
    spawn_broker_with(Broker::new()).await
}

pub(crate) async fn spawn_broker_with(broker: Broker) -> (String, Arc<Mutex<Broker>>) {
    let listener = bind("127.0.0.1:0").await.expect("bind test broker");
    let addr = listener.local_addr().expect("local addr").to_string();
    let broker = Arc::new(Mutex::new(broker));
    tokio::spawn(start_websocket_server(listener, broker.clone()));
    (addr, broker)
}

/// Polls `check` every 10ms for up to two seconds.
pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
