//! Message-passing IPC over unix domain sockets.
//!
//! The crate provides the out-of-band control channel of a shared-memory
//! IPC system: servers publish typed notifications and accept short
//! control requests, clients open ordered byte-stream connections to a
//! named service, send control messages, correlate requests with replies
//! and receive asynchronous notifications.
//!
//! All I/O and user callbacks are serialized onto the background thread
//! of a shared [`Engine`]; the public client and server APIs are callable
//! from any thread.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod server;

mod engine;
mod frame;
mod sync;
mod timer;

pub use crate::client::{ClientConnection, State, StopReason};
pub use crate::config::{ClientConfig, ServerConfig, ServiceProtocolConfig};
pub use crate::engine::Engine;
pub use crate::error::{Error, Result};
pub use crate::server::{ClientIdentity, ConnectionHandler, Server, ServerConnection, UserData};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    static SERVICE_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn protocol(max_size: u32) -> ServiceProtocolConfig {
        let serial = SERVICE_COUNTER.fetch_add(1, Ordering::Relaxed);
        ServiceProtocolConfig {
            identifier: format!("courier_test_{}_{}", std::process::id(), serial),
            max_send_size: max_size,
            max_reply_size: max_size,
            max_notify_size: max_size,
        }
    }

    /// State callback capturing the observed sequence and feeding a
    /// channel for the test thread to wait on.
    fn state_tracker() -> (
        impl Fn(State) + Send + Sync + 'static,
        mpsc::Receiver<State>,
        Arc<Mutex<Vec<State>>>,
    ) {
        let (sender, receiver) = mpsc::channel();
        let sender = Mutex::new(sender);
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_inner = log.clone();
        let callback = move |state: State| {
            log_inner.lock().unwrap().push(state);
            drop(sender.lock().unwrap().send(state));
        };
        (callback, receiver, log)
    }

    fn wait_for_state(receiver: &mpsc::Receiver<State>, wanted: State) {
        loop {
            let state = receiver.recv_timeout(WAIT).unwrap();
            if state == wanted {
                return;
            }
        }
    }

    /// Checks invariant: a state sequence is a prefix of
    /// Starting, Ready?, Stopping, Stopped, possibly repeated by restarts.
    fn assert_valid_sequence(observed: &[State]) {
        let mut expected_next: Vec<State> = vec![State::Starting];
        for &state in observed {
            assert!(
                expected_next.contains(&state),
                "Unexpected state {:?} in sequence {:?}",
                state,
                observed
            );
            expected_next = match state {
                State::Starting => vec![State::Ready, State::Stopping],
                State::Ready => vec![State::Stopping],
                State::Stopping => vec![State::Stopped],
                State::Stopped => vec![State::Starting],
            };
        }
    }

    fn echo_server(engine: &Arc<Engine>, protocol_config: &ServiceProtocolConfig) -> Server {
        let server = Server::new(
            engine.clone(),
            protocol_config,
            ServerConfig {
                max_queued_notifies: 4,
                ..ServerConfig::default()
            },
        )
        .unwrap();
        server
            .start_listening(
                |_| Ok(UserData::Tag(0)),
                |_| (),
                |connection, message| connection.notify(message),
                |connection, message| connection.reply(message),
            )
            .unwrap();
        server
    }

    #[test]
    fn test_echo_roundtrip_all_send_flavors() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(6);
        let _server = echo_server(&engine, &protocol_config);

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, log) = state_tracker();
        let (notify_send, notify_recv) = mpsc::channel();
        let notify_send = Mutex::new(notify_send);
        client.start(state_callback, move |message: &[u8]| {
            drop(notify_send.lock().unwrap().send(message.to_vec()));
        });
        wait_for_state(&states, State::Ready);

        let payload = [1u8, 2, 3, 4, 5, 6];

        // Reply through a callback
        let (reply_send, reply_recv) = mpsc::channel();
        let reply_send = Mutex::new(reply_send);
        client
            .send_with_callback(&payload, move |reply| {
                drop(reply_send.lock().unwrap().send(reply.map(|message| message.to_vec())));
            })
            .unwrap();
        let reply = reply_recv.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(reply, payload.to_vec());

        // Reply into a caller-owned buffer
        let mut buffer = [0u8; 6];
        let buffer_ptr = buffer.as_ptr();
        let reply = client.send_wait_reply(&payload, &mut buffer).unwrap();
        assert_eq!(reply, &payload[..]);
        assert_eq!(reply.len(), 6);
        assert_eq!(reply.as_ptr(), buffer_ptr);

        // Fire-and-forget echoes back as a notification
        client.send(&payload).unwrap();
        let notified = notify_recv.recv_timeout(WAIT).unwrap();
        assert_eq!(notified, payload.to_vec());

        client.stop();
        wait_for_state(&states, State::Stopped);
        assert_eq!(client.stop_reason(), StopReason::UserRequested);
        assert_valid_sequence(&log.lock().unwrap());
    }

    #[test]
    fn test_payload_size_boundaries() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(6);
        let _server = echo_server(&engine, &protocol_config);

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, _log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        // Exactly the limit is accepted, one byte more is not
        client.send(&[0u8; 6]).unwrap();
        assert_eq!(client.send(&[0u8; 7]).unwrap_err(), Error::NoMemory);

        // A reply larger than the caller's buffer is refused
        let mut small = [0u8; 3];
        assert_eq!(
            client.send_wait_reply(&[1, 2, 3, 4, 5, 6], &mut small).unwrap_err(),
            Error::NoMemory
        );

        client.stop();
        wait_for_state(&states, State::Stopped);
    }

    #[test]
    fn test_rejected_connection_stops_client() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let server = Server::new(engine.clone(), &protocol_config, ServerConfig::default()).unwrap();
        server
            .start_listening(
                |_| Err(Error::AccessDenied),
                |_| (),
                |_, _| Ok(()),
                |_, _| Ok(()),
            )
            .unwrap();

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());

        wait_for_state(&states, State::Stopped);
        // The stream transport completes the connect before the server can
        // reject, so the client sees the peer closing the fresh connection
        assert_eq!(client.stop_reason(), StopReason::ClosedByPeer);
        assert_valid_sequence(&log.lock().unwrap());
    }

    #[test]
    fn test_client_retries_until_server_appears() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());

        // No server yet: the client keeps retrying in Starting
        thread::sleep(Duration::from_millis(300));
        assert_eq!(client.state(), State::Starting);

        let _server = echo_server(&engine, &protocol_config);
        wait_for_state(&states, State::Ready);

        let observed = log.lock().unwrap().clone();
        assert_eq!(observed, vec![State::Starting, State::Ready]);

        client.stop();
        wait_for_state(&states, State::Stopped);
    }

    #[test]
    fn test_server_side_disconnect_reaches_client() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let server = Server::new(engine.clone(), &protocol_config, ServerConfig::default()).unwrap();
        server
            .start_listening(
                |_| Ok(UserData::Tag(7)),
                |_| (),
                |connection, _| {
                    // Any payload asks the server to drop the session
                    connection.request_disconnect();
                    Ok(())
                },
                |_, _| Ok(()),
            )
            .unwrap();

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        client.send(&[1]).unwrap();

        wait_for_state(&states, State::Stopped);
        assert_eq!(client.stop_reason(), StopReason::ClosedByPeer);
        assert_valid_sequence(&log.lock().unwrap());

        // Destroying the stopped client must not deadlock
        drop(client);
    }

    #[test]
    fn test_notify_backpressure() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let server = Server::new(
            engine.clone(),
            &protocol_config,
            ServerConfig {
                max_queued_notifies: 1,
                ..ServerConfig::default()
            },
        )
        .unwrap();

        let (outcome_send, outcome_recv) = mpsc::channel();
        let outcome_send = Mutex::new(outcome_send);
        server
            .start_listening(
                |_| Ok(UserData::Tag(0)),
                |_| (),
                move |connection, message| {
                    // Two back-to-back notifications from the callback: the
                    // transport cannot drain until the callback returns, so
                    // the second one must see the pool exhausted.
                    let first = connection.notify(message);
                    let second = connection.notify(message);
                    drop(outcome_send.lock().unwrap().send((first, second)));
                    Ok(())
                },
                |_, _| Ok(()),
            )
            .unwrap();

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, _log) = state_tracker();
        let (notify_send, notify_recv) = mpsc::channel();
        let notify_send = Mutex::new(notify_send);
        client.start(state_callback, move |message: &[u8]| {
            drop(notify_send.lock().unwrap().send(message.to_vec()));
        });
        wait_for_state(&states, State::Ready);

        client.send(&[1]).unwrap();
        let (first, second) = outcome_recv.recv_timeout(WAIT).unwrap();
        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(Error::NoMemory));

        // The queued notification still arrives
        assert_eq!(notify_recv.recv_timeout(WAIT).unwrap(), vec![1]);

        // Once drained, the pool accepts again
        client.send(&[2]).unwrap();
        let (first, second) = outcome_recv.recv_timeout(WAIT).unwrap();
        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(Error::NoMemory));
        assert_eq!(notify_recv.recv_timeout(WAIT).unwrap(), vec![2]);

        client.stop();
        wait_for_state(&states, State::Stopped);
    }

    #[test]
    fn test_send_queue_overflow_and_recovery() {
        // Separate engines so the server callback may block without
        // stalling the client's background thread
        let server_engine = Arc::new(Engine::new(None));
        let client_engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let server = Server::new(server_engine.clone(), &protocol_config, ServerConfig::default()).unwrap();
        let (request_send, request_recv) = mpsc::channel();
        let request_send = Mutex::new(request_send);
        let (release_send, release_recv) = mpsc::channel::<()>();
        let release_recv = Mutex::new(release_recv);
        let (sent_send, sent_recv) = mpsc::channel();
        let sent_send = Mutex::new(sent_send);
        server
            .start_listening(
                |_| Ok(UserData::Tag(0)),
                |_| (),
                move |_, message| {
                    drop(sent_send.lock().unwrap().send(message.to_vec()));
                    Ok(())
                },
                move |connection, message| {
                    drop(request_send.lock().unwrap().send(()));
                    // Park the reply until the test releases it
                    drop(release_recv.lock().unwrap().recv_timeout(WAIT));
                    connection.reply(message)
                },
            )
            .unwrap();

        // One async reply slot plus one queued send: pool of two
        let client_config = ClientConfig {
            max_async_replies: 1,
            max_queued_sends: 1,
            fully_ordered: true,
            truly_async: false,
            sync_first_connect: false,
        };
        let client = ClientConnection::new(client_engine.clone(), &protocol_config, client_config).unwrap();
        let (state_callback, states, _log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        let (reply_send, reply_recv) = mpsc::channel();
        let reply_send = Mutex::new(reply_send);
        client
            .send_with_callback(&[9], move |reply| {
                drop(reply_send.lock().unwrap().send(reply.is_ok()));
            })
            .unwrap();
        request_recv.recv_timeout(WAIT).unwrap();

        // The request is outstanding; sends are queued until the pool runs dry
        client.send(&[1]).unwrap();
        client.send(&[2]).unwrap();
        assert_eq!(client.send(&[3]).unwrap_err(), Error::NoMemory);

        // Releasing the reply drains the queue and frees the pool
        release_send.send(()).unwrap();
        assert!(reply_recv.recv_timeout(WAIT).unwrap());
        client.send(&[4]).unwrap();

        assert_eq!(sent_recv.recv_timeout(WAIT).unwrap(), vec![1]);
        assert_eq!(sent_recv.recv_timeout(WAIT).unwrap(), vec![2]);
        assert_eq!(sent_recv.recv_timeout(WAIT).unwrap(), vec![4]);

        client.stop();
        wait_for_state(&states, State::Stopped);
    }

    #[test]
    fn test_ordering_across_send_flavors() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let server = Server::new(engine.clone(), &protocol_config, ServerConfig::default()).unwrap();
        let (received_send, received_recv) = mpsc::channel();
        let request_sender = Mutex::new(received_send.clone());
        let sent_sender = Mutex::new(received_send);
        server
            .start_listening(
                |_| Ok(UserData::Tag(0)),
                |_| (),
                move |_, message| {
                    drop(sent_sender.lock().unwrap().send(message.to_vec()));
                    Ok(())
                },
                move |connection, message| {
                    drop(request_sender.lock().unwrap().send(message.to_vec()));
                    connection.reply(message)
                },
            )
            .unwrap();

        let client_config = ClientConfig {
            max_async_replies: 2,
            max_queued_sends: 4,
            fully_ordered: true,
            truly_async: true,
            sync_first_connect: false,
        };
        let client = ClientConnection::new(engine.clone(), &protocol_config, client_config).unwrap();
        let (state_callback, states, _log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        for value in 1u8..=4 {
            client.send(&[value]).unwrap();
        }

        for value in 1u8..=4 {
            assert_eq!(received_recv.recv_timeout(WAIT).unwrap(), vec![value]);
        }

        client.stop();
        wait_for_state(&states, State::Stopped);
    }

    struct EchoHandler {
        disconnects: Mutex<mpsc::Sender<()>>,
    }

    impl ConnectionHandler for EchoHandler {
        fn on_message(&self, connection: &ServerConnection, message: &[u8]) -> Result<()> {
            connection.notify(message)
        }

        fn on_message_with_reply(&self, connection: &ServerConnection, message: &[u8]) -> Result<()> {
            connection.reply(message)
        }

        fn on_disconnect(&self, _connection: &ServerConnection) {
            drop(self.disconnects.lock().unwrap().send(()));
        }
    }

    #[test]
    fn test_connection_handler_dispatch() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(32);

        let server = Server::new(
            engine.clone(),
            &protocol_config,
            ServerConfig {
                max_queued_notifies: 2,
                ..ServerConfig::default()
            },
        )
        .unwrap();

        let (identity_send, identity_recv) = mpsc::channel();
        let identity_send = Mutex::new(identity_send);
        let (disconnect_send, disconnect_recv) = mpsc::channel();
        let disconnect_send = Mutex::new(disconnect_send);
        server
            .start_listening(
                move |connection| {
                    drop(identity_send.lock().unwrap().send(*connection.client_identity()));
                    Ok(UserData::Handler(Box::new(EchoHandler {
                        disconnects: Mutex::new(disconnect_send.lock().unwrap().clone()),
                    })))
                },
                |_| (),
                |_, _| Ok(()),
                |_, _| Ok(()),
            )
            .unwrap();

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, _log) = state_tracker();
        let (notify_send, notify_recv) = mpsc::channel();
        let notify_send = Mutex::new(notify_send);
        client.start(state_callback, move |message: &[u8]| {
            drop(notify_send.lock().unwrap().send(message.to_vec()));
        });
        wait_for_state(&states, State::Ready);

        // The connection is handled by the owned handler, not the
        // server-wide callbacks
        let mut buffer = [0u8; 32];
        let reply = client.send_wait_reply(b"handled", &mut buffer).unwrap();
        assert_eq!(reply, b"handled");

        client.send(b"pushed").unwrap();
        assert_eq!(notify_recv.recv_timeout(WAIT).unwrap(), b"pushed".to_vec());

        // The listener saw this process behind the socket
        let identity = identity_recv.recv_timeout(WAIT).unwrap();
        assert_eq!(identity.pid as u32, std::process::id());

        // Dropping the session reaches the handler
        client.stop();
        wait_for_state(&states, State::Stopped);
        disconnect_recv.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_stop_fails_pending_reply_callbacks() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let server = Server::new(engine.clone(), &protocol_config, ServerConfig::default()).unwrap();
        let (request_send, request_recv) = mpsc::channel();
        let request_send = Mutex::new(request_send);
        server
            .start_listening(
                |_| Ok(UserData::Tag(0)),
                |_| (),
                |_, _| Ok(()),
                move |_, _| {
                    // Accept the request but never answer it
                    drop(request_send.lock().unwrap().send(()));
                    Ok(())
                },
            )
            .unwrap();

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, _log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        let (outcome_send, outcome_recv) = mpsc::channel();
        let first_outcome = Mutex::new(outcome_send.clone());
        let second_outcome = Mutex::new(outcome_send);
        client
            .send_with_callback(&[1], move |reply| {
                drop(first_outcome.lock().unwrap().send(reply.err()));
            })
            .unwrap();
        client
            .send_with_callback(&[2], move |reply| {
                drop(second_outcome.lock().unwrap().send(reply.err()));
            })
            .unwrap();
        request_recv.recv_timeout(WAIT).unwrap();

        client.stop();
        wait_for_state(&states, State::Stopped);

        // Both the in-flight and the queued request fail exactly once
        assert_eq!(outcome_recv.recv_timeout(WAIT).unwrap(), Some(Error::BrokenPipe));
        assert_eq!(outcome_recv.recv_timeout(WAIT).unwrap(), Some(Error::BrokenPipe));
    }

    #[test]
    fn test_stop_unblocks_waiting_request() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let server = Server::new(engine.clone(), &protocol_config, ServerConfig::default()).unwrap();
        let (request_send, request_recv) = mpsc::channel();
        let request_send = Mutex::new(request_send);
        server
            .start_listening(
                |_| Ok(UserData::Tag(0)),
                |_| (),
                |_, _| Ok(()),
                move |_, _| {
                    drop(request_send.lock().unwrap().send(()));
                    Ok(())
                },
            )
            .unwrap();

        let client = Arc::new(
            ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap(),
        );
        let (state_callback, states, _log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        let waiting = client.clone();
        let worker = thread::spawn(move || {
            let mut buffer = [0u8; 16];
            waiting.send_wait_reply(&[1], &mut buffer).map(|reply| reply.to_vec())
        });

        request_recv.recv_timeout(WAIT).unwrap();
        client.stop();

        assert_eq!(worker.join().unwrap().unwrap_err(), Error::BrokenPipe);
        wait_for_state(&states, State::Stopped);
    }

    #[test]
    fn test_stop_is_idempotent_and_restart_works() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);
        let _server = echo_server(&engine, &protocol_config);

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        client.stop();
        client.stop();
        wait_for_state(&states, State::Stopped);
        assert_eq!(client.stop_reason(), StopReason::UserRequested);

        {
            let observed = log.lock().unwrap();
            let stops = observed.iter().filter(|&&state| state == State::Stopped).count();
            assert_eq!(stops, 1);
        }

        // Restart from a user-requested stop succeeds
        client.restart();
        wait_for_state(&states, State::Ready);
        client.send(&[5]).unwrap();

        client.stop();
        wait_for_state(&states, State::Stopped);
        assert_valid_sequence(&log.lock().unwrap());
    }

    #[test]
    fn test_restart_noop_while_running() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);
        let _server = echo_server(&engine, &protocol_config);

        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        client.restart();
        assert_eq!(client.state(), State::Ready);

        client.stop();
        wait_for_state(&states, State::Stopped);

        let observed = log.lock().unwrap().clone();
        assert_eq!(
            observed,
            vec![State::Starting, State::Ready, State::Stopping, State::Stopped]
        );
    }

    #[test]
    fn test_sync_first_connect() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);
        let _server = echo_server(&engine, &protocol_config);

        let client_config = ClientConfig {
            sync_first_connect: true,
            ..ClientConfig::default()
        };
        let client = ClientConnection::new(engine.clone(), &protocol_config, client_config).unwrap();
        let (state_callback, states, _log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        client.send(&[1]).unwrap();
        client.stop();
        wait_for_state(&states, State::Stopped);
    }

    #[test]
    fn test_server_stop_listening_disconnects_clients() {
        let engine = Arc::new(Engine::new(None));
        let protocol_config = protocol(16);

        let server = echo_server(&engine, &protocol_config);
        let client = ClientConnection::new(engine.clone(), &protocol_config, ClientConfig::default()).unwrap();
        let (state_callback, states, log) = state_tracker();
        client.start(state_callback, |_: &[u8]| ());
        wait_for_state(&states, State::Ready);

        server.stop_listening();

        wait_for_state(&states, State::Stopped);
        assert_eq!(client.stop_reason(), StopReason::ClosedByPeer);
        assert_valid_sequence(&log.lock().unwrap());
    }
}
