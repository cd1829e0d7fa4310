use std::net::SocketAddr;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use socket2::{Domain, Type};
use usock::{Config, Ctx, Engine, EngineId, Event, Segments};

const TIMEOUT: Duration = Duration::from_secs(5);

type Events = Receiver<(EngineId, Event)>;

fn sink() -> (Sender<(EngineId, Event)>, Events) {
  unbounded()
}

fn next(events: &Events) -> Event {
  events.recv_timeout(TIMEOUT).expect("timed out waiting for an engine event").1
}

/// Asserts the channel stays empty long enough to catch stray duplicates.
fn assert_quiet(events: &Events) {
  if let Ok((id, event)) = events.recv_timeout(Duration::from_millis(200)) {
    panic!("unexpected event {event:?} from {id}");
  }
}

fn stream_engine(ctx: &Ctx) -> (Engine, Events) {
  let (tx, events) = sink();
  let engine =
    Engine::init(ctx, Domain::IPV4, Type::STREAM, None, Box::new(tx)).unwrap();
  (engine, events)
}

fn listener(ctx: &Ctx, backlog: i32) -> (Engine, Events, SocketAddr) {
  let (engine, events) = stream_engine(ctx);
  engine.bind("127.0.0.1:0".parse().unwrap()).unwrap();
  engine.listen(backlog).unwrap();
  let addr = engine.local_addr().unwrap();
  (engine, events, addr)
}

/// Listener-side accept plus client-side connect, both verified.
fn connected_pair(ctx: &Ctx) -> (Engine, Events, Engine, Events) {
  let (listen_engine, listen_events, addr) = listener(ctx, 1);

  let (peer_tx, peer_events) = sink();
  listen_engine.accept(Box::new(peer_tx));

  let (client, client_events) = stream_engine(ctx);
  client.connect(addr);

  let Event::Connected = next(&client_events) else {
    panic!("expected Connected");
  };
  let Event::Accepted(peer) = next(&listen_events) else {
    panic!("expected Accepted");
  };
  (client, client_events, peer, peer_events)
}

#[test]
fn accept_connect_and_exchange() {
  let ctx = Ctx::new().unwrap();
  let (listen_engine, listen_events, addr) = listener(&ctx, 1);

  let (peer_tx, peer_events) = sink();
  listen_engine.accept(Box::new(peer_tx));

  let (client, client_events) = stream_engine(&ctx);
  client.connect(addr);

  let Event::Connected = next(&client_events) else {
    panic!("expected Connected");
  };
  let Event::Accepted(peer) = next(&listen_events) else {
    panic!("expected Accepted");
  };
  // Exactly one CONNECTED and one ACCEPTED.
  assert_quiet(&client_events);
  assert_quiet(&listen_events);

  peer.send(Segments::from(vec![0x01, 0x02, 0x03]));
  client.recv(Vec::new(), 3);

  let Event::Received(buf) = next(&client_events) else {
    panic!("expected Received");
  };
  assert_eq!(buf, [0x01, 0x02, 0x03]);
  let Event::Sent(segs) = next(&peer_events) else { panic!("expected Sent") };
  assert_eq!(segs.total_bytes(), 3);
}

#[test]
fn recv_past_end_of_stream_is_error_not_short_read() {
  let ctx = Ctx::new().unwrap();
  let (client, client_events, peer, peer_events) = connected_pair(&ctx);

  peer.send(Segments::from(vec![1, 2, 3]));
  let Event::Sent(_) = next(&peer_events) else { panic!("expected Sent") };
  peer.close();

  client.recv(Vec::new(), 10);
  let Event::Error(err) = next(&client_events) else {
    panic!("expected Error, never a short Received");
  };
  assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
  assert_quiet(&client_events);
}

#[test]
fn connect_to_dead_port_errors_exactly_once() {
  let ctx = Ctx::new().unwrap();

  // Bind a port, then free it, so nothing is listening there.
  let (listen_engine, listen_events, addr) = listener(&ctx, 1);
  listen_engine.close();
  let Event::Closed = next(&listen_events) else { panic!("expected Closed") };

  let (engine, events) = stream_engine(&ctx);
  engine.connect(addr);

  let Event::Error(err) = next(&events) else { panic!("expected Error") };
  assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
  assert_quiet(&events);

  // The failed engine is still closable, and CLOSED is its last event.
  engine.close();
  let Event::Closed = next(&events) else { panic!("expected Closed") };
  assert_quiet(&events);
}

#[test]
fn scatter_gather_send_completes_exactly_once() {
  let ctx = Ctx::new().unwrap();
  let (client, client_events, peer, peer_events) = connected_pair(&ctx);

  let mut segs = Segments::from(vec![0xa1]);
  segs.push(vec![0xb2, 0xb3]);
  segs.push(vec![0xc4; 4096]);
  client.send(segs);
  peer.recv(Vec::new(), 4099);

  let Event::Received(buf) = next(&peer_events) else {
    panic!("expected Received");
  };
  assert_eq!(buf.len(), 4099);
  assert_eq!(&buf[..3], &[0xa1, 0xb2, 0xb3]);
  assert!(buf[3..].iter().all(|&b| b == 0xc4));

  let Event::Sent(segs) = next(&client_events) else {
    panic!("expected Sent")
  };
  assert_eq!(segs.total_bytes(), 4099);
  assert_quiet(&client_events);
}

#[test]
fn send_larger_than_socket_buffers_yields_single_sent() {
  let ctx = Ctx::new().unwrap();
  let (client, client_events, peer, peer_events) = connected_pair(&ctx);

  // Shrink the send buffer so the payload takes many partial writes.
  client
    .setsockopt(
      libc::SOL_SOCKET,
      libc::SO_SNDBUF,
      4096i32.to_ne_bytes().to_vec(),
    )
    .unwrap();

  let total = 1 << 20;
  client.send(Segments::from(vec![0x77; total]));
  peer.recv(Vec::new(), total);

  let Event::Received(buf) = next(&peer_events) else {
    panic!("expected Received");
  };
  assert_eq!(buf.len(), total);
  assert!(buf.iter().all(|&b| b == 0x77));

  let Event::Sent(segs) = next(&client_events) else {
    panic!("expected exactly one Sent");
  };
  assert_eq!(segs.total_bytes(), total);
  assert_quiet(&client_events);
}

#[test]
fn consecutive_recvs_preserve_stream_order() {
  let ctx = Ctx::new().unwrap();
  let (client, client_events, peer, peer_events) = connected_pair(&ctx);

  peer.send(Segments::from((0..10u8).collect::<Vec<_>>()));
  let Event::Sent(_) = next(&peer_events) else { panic!("expected Sent") };

  client.recv(Vec::new(), 4);
  let Event::Received(buf) = next(&client_events) else {
    panic!("expected first Received");
  };
  assert_eq!(buf, [0, 1, 2, 3]);

  // The tail was already batch-read; this must not lose or reorder it.
  client.recv(buf, 6);
  let Event::Received(buf) = next(&client_events) else {
    panic!("expected second Received");
  };
  assert_eq!(buf, [4, 5, 6, 7, 8, 9]);
}

#[test]
fn close_cancels_pending_recv() {
  let ctx = Ctx::new().unwrap();
  let (client, client_events, _peer, _peer_events) = connected_pair(&ctx);

  // No data is coming; the receive parks on the poller.
  client.recv(Vec::new(), 8);
  client.close();

  let Event::Closed = next(&client_events) else {
    panic!("expected Closed as the final event");
  };
  assert_quiet(&client_events);
}

#[test]
fn close_is_idempotent() {
  let ctx = Ctx::new().unwrap();
  let (engine, events) = stream_engine(&ctx);

  engine.close();
  engine.close();

  let Event::Closed = next(&events) else { panic!("expected Closed") };
  assert_quiet(&events);

  // Synchronous operations after close fail fast.
  let err = engine.bind("127.0.0.1:0".parse().unwrap()).unwrap_err();
  assert!(matches!(err, usock::Error::Closed));
}

#[test]
fn listener_accepts_again_after_rearming() {
  let ctx = Ctx::new().unwrap();
  let (listen_engine, listen_events, addr) = listener(&ctx, 4);

  for round in 0..3 {
    let (peer_tx, peer_events) = sink();
    listen_engine.accept(Box::new(peer_tx));

    let (client, client_events) = stream_engine(&ctx);
    client.connect(addr);

    let Event::Connected = next(&client_events) else {
      panic!("round {round}: expected Connected");
    };
    let Event::Accepted(peer) = next(&listen_events) else {
      panic!("round {round}: expected Accepted");
    };

    peer.send(Segments::from(vec![round as u8]));
    client.recv(Vec::new(), 1);
    let Event::Received(buf) = next(&client_events) else {
      panic!("round {round}: expected Received");
    };
    assert_eq!(buf, [round as u8]);
    let Event::Sent(_) = next(&peer_events) else {
      panic!("round {round}: expected Sent");
    };
  }
}

#[test]
fn dropping_ctx_closes_live_engines() {
  let ctx = Ctx::new().unwrap();
  let (engine, events) = stream_engine(&ctx);

  drop(ctx);

  let Event::Closed = next(&events) else { panic!("expected Closed") };
  let err = engine.listen(1).unwrap_err();
  assert!(matches!(err, usock::Error::Closed));
}

#[test]
fn randomized_exchange_across_workers() {
  let ctx =
    Ctx::with_config(Config { workers: 2, ..Default::default() }).unwrap();
  let (listen_engine, listen_events, addr) = listener(&ctx, 16);

  for _ in 0..16 {
    let (peer_tx, peer_events) = sink();
    listen_engine.accept(Box::new(peer_tx));

    let (client, client_events) = stream_engine(&ctx);
    client.connect(addr);
    let Event::Connected = next(&client_events) else {
      panic!("expected Connected");
    };
    let Event::Accepted(peer) = next(&listen_events) else {
      panic!("expected Accepted");
    };

    // Random payload, randomly split over up to MAX_SEGMENTS segments.
    let payload: Vec<u8> =
      (0..fastrand::usize(1..8192)).map(|_| fastrand::u8(..)).collect();
    let mut segs = Segments::new();
    let mut rest = payload.as_slice();
    for left in (1..=usock::MAX_SEGMENTS).rev() {
      if rest.is_empty() {
        break;
      }
      let cut =
        if left == 1 { rest.len() } else { fastrand::usize(0..=rest.len()) };
      let (head, tail) = rest.split_at(cut);
      if !head.is_empty() {
        segs.push(head.to_vec());
      }
      rest = tail;
    }

    client.send(segs);
    peer.recv(Vec::new(), payload.len());

    let Event::Received(buf) = next(&peer_events) else {
      panic!("expected Received");
    };
    assert_eq!(buf, payload);
    let Event::Sent(_) = next(&client_events) else { panic!("expected Sent") };

    // CLOSED is the last event on both sides.
    client.close();
    peer.close();
    let Event::Closed = next(&client_events) else { panic!("expected Closed") };
    let Event::Closed = next(&peer_events) else { panic!("expected Closed") };
    assert_quiet(&client_events);
    assert_quiet(&peer_events);
  }
}
