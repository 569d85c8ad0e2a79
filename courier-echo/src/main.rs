//! Echo demo wiring a courier server and client together.

use courier::logging::{self, info};
use courier::{
    ClientConfig, ClientConnection, Engine, Server, ServerConfig, ServiceProtocolConfig, State, UserData,
};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// Starts an echo server and a client on one engine, round-trips a
/// message through every send flavor and shuts down. An optional argument
/// names a TOML file with the service protocol configuration.
fn main() {
    let log = logging::init();

    let protocol_config = match env::args().nth(1) {
        Some(path) => ServiceProtocolConfig::load(path),
        None => ServiceProtocolConfig {
            identifier: format!("echo_demo_{}", std::process::id()),
            max_send_size: 64,
            max_reply_size: 64,
            max_notify_size: 64,
        },
    };

    let engine = Arc::new(Engine::new(&log));

    let server = Server::new(
        engine.clone(),
        &protocol_config,
        ServerConfig {
            max_queued_notifies: 4,
            ..ServerConfig::default()
        },
    )
    .expect("Error creating server");
    server
        .start_listening(
            |connection| {
                println!(
                    "server: connection from pid {}",
                    connection.client_identity().pid
                );
                Ok(UserData::Tag(0))
            },
            |_| (),
            |connection, message| connection.notify(message),
            |connection, message| connection.reply(message),
        )
        .expect("Error starting listener");

    let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default())
        .expect("Error creating client");

    let ready = Arc::new(AtomicBool::new(false));
    let ready_flag = ready.clone();
    let (notify_send, notify_recv) = mpsc::channel();
    let notify_send = Mutex::new(notify_send);
    client.start(
        move |state| {
            if state == State::Ready {
                ready_flag.store(true, Ordering::Release);
            }
        },
        move |message: &[u8]| {
            drop(notify_send.lock().unwrap().send(message.to_vec()));
        },
    );
    while !ready.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(1));
    }

    let payload = b"hello courier";

    let mut buffer = [0u8; 64];
    let reply = client
        .send_wait_reply(payload, &mut buffer)
        .expect("Error waiting for reply");
    println!("client: reply  {}", String::from_utf8_lossy(reply));

    client.send(payload).expect("Error sending");
    let notified = notify_recv
        .recv_timeout(Duration::from_secs(5))
        .expect("Notification did not arrive");
    println!("client: notify {}", String::from_utf8_lossy(&notified));

    client.stop();
    drop(client);
    server.stop_listening();

    info!(log, "echo demo finished"; "service" => protocol_config.identifier.clone());
}
