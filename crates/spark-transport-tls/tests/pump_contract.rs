//! TLS 泵契约测试。
//!
//! # 教案式说明
//! - **意图 (Why)**：在不触碰套接字的前提下验证泵的排队、门控与失败语义；
//! - **结构 (How)**：下层使用容量受限的内存管道，引擎使用真实 `rustls` 或脚本化引擎；
//! - **契约 (What)**：所有调用都不阻塞，握手完成前不放行明文，失败状态粘滞。

mod support;

use proptest::prelude::*;
use spark_transport::{Status, Stream, StreamFlags};
use spark_transport_tls::{
    ENCRYPT_STAGE_CAPACITY, RustlsEngine, TlsListener, TlsState, TlsStream,
};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use support::{
    MemoryPipe, PipeListener, Script, ScriptedEngine, drain_pipe, localhost_configs,
    localhost_context, pipe_pair,
};
use tracing_test::traced_test;

const MAX_ROUNDS: usize = 20_000;

fn rustls_pair(chunk: usize) -> (TlsStream, TlsStream) {
    let (client_config, server_config) = localhost_configs();
    let (client_end, server_end) = pipe_pair(chunk);
    let name = "localhost".try_into().expect("服务器名");
    let client_engine = RustlsEngine::client(client_config, name).expect("客户端引擎");
    let server_engine = RustlsEngine::server(server_config).expect("服务端引擎");
    let client = TlsStream::client(
        Box::new(client_end),
        Box::new(client_engine),
        StreamFlags::DEFAULT,
    )
    .expect("客户端握手起步");
    let server = TlsStream::server(
        Box::new(server_end),
        Box::new(server_engine),
        StreamFlags::DEFAULT,
    );
    (client, server)
}

/// 交替驱动两端，直到双方都收齐对方的数据。
fn exchange(
    client: &mut TlsStream,
    server: &mut TlsStream,
    to_server: &[u8],
    to_client: &[u8],
    read_chunk: usize,
) -> (Vec<u8>, Vec<u8>) {
    let mut client_sent = 0;
    let mut server_sent = 0;
    let mut at_server = Vec::new();
    let mut at_client = Vec::new();
    let mut buf = vec![0u8; read_chunk];

    for _ in 0..MAX_ROUNDS {
        if at_server.len() == to_server.len() && at_client.len() == to_client.len() {
            return (at_server, at_client);
        }
        client_sent += client
            .write(&to_server[client_sent..], StreamFlags::DEFAULT)
            .expect("客户端写入");
        server_sent += server
            .write(&to_client[server_sent..], StreamFlags::DEFAULT)
            .expect("服务端写入");
        client.flush(StreamFlags::DEFAULT).expect("客户端 flush");
        server.flush(StreamFlags::DEFAULT).expect("服务端 flush");

        let n = server.read(&mut buf, StreamFlags::DEFAULT).expect("服务端读取");
        at_server.extend_from_slice(&buf[..n]);
        let n = client.read(&mut buf, StreamFlags::DEFAULT).expect("客户端读取");
        at_client.extend_from_slice(&buf[..n]);
    }
    panic!(
        "交换未在 {MAX_ROUNDS} 轮内完成：服务端收到 {}/{}，客户端收到 {}/{}",
        at_server.len(),
        to_server.len(),
        at_client.len(),
        to_client.len()
    );
}

fn sample(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect()
}

#[test]
fn rustls_round_trip_through_tiny_pipes() {
    let (mut client, mut server) = rustls_pair(7);
    assert_eq!(client.state(), TlsState::Handshaking);
    assert_eq!(server.state(), TlsState::Init);

    let to_server = sample(5_000, 3);
    let to_client = sample(3_333, 101);
    let (at_server, at_client) = exchange(&mut client, &mut server, &to_server, &to_client, 5);
    assert_eq!(at_server, to_server);
    assert_eq!(at_client, to_client);
    assert_eq!(client.state(), TlsState::Established);
    assert_eq!(server.state(), TlsState::Established);

    client.close().expect("客户端关闭");
    let mut buf = [0u8; 16];
    let err = loop {
        match server.read(&mut buf, StreamFlags::DEFAULT) {
            Ok(0) => continue,
            Ok(n) => panic!("关闭后不应再有 {n} 字节明文"),
            Err(err) => break err,
        }
    };
    assert_eq!(err.status(), Status::StreamClosed);
    server.close().expect("服务端关闭");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn rustls_round_trip_preserves_order(
        payload in proptest::collection::vec(any::<u8>(), 0..2_048),
        chunk in 1usize..64,
        read_chunk in 1usize..300,
    ) {
        let (mut client, mut server) = rustls_pair(chunk);
        let (at_server, at_client) = exchange(&mut client, &mut server, &payload, &payload, read_chunk);
        prop_assert_eq!(at_server, payload.clone());
        prop_assert_eq!(at_client, payload);
    }
}

struct Scripted {
    stream: TlsStream,
    peer: MemoryPipe,
    script: Arc<Mutex<Script>>,
    /// 泵下层写方向的闸门。
    gate: Arc<AtomicBool>,
}

fn scripted_client(script: Script, chunk: usize) -> Scripted {
    let (engine, script) = ScriptedEngine::new(script);
    let (near, peer) = pipe_pair(chunk);
    let gate = near.write_gate();
    let stream = TlsStream::client(Box::new(near), Box::new(engine), StreamFlags::DEFAULT)
        .expect("脚本化客户端");
    Scripted {
        stream,
        peer,
        script,
        gate,
    }
}

#[test]
fn plaintext_is_gated_until_handshake_completes() {
    let Scripted {
        mut stream,
        mut peer,
        script,
        ..
    } = scripted_client(
        Script {
            handshaking: true,
            outbound: b"hello".iter().copied().collect(),
            ..Script::default()
        },
        1024,
    );
    assert_eq!(drain_pipe(&mut peer), b"hello", "首个握手步骤立即发出");

    assert_eq!(stream.write(b"early data", StreamFlags::DEFAULT).expect("暂存"), 10);
    stream.flush(StreamFlags::DEFAULT).expect("flush");
    assert_eq!(stream.staged_plaintext(), 10, "握手完成前不加密");

    peer.write(b"secret", StreamFlags::DEFAULT).expect("对端写入");
    let mut buf = [0u8; 32];
    for _ in 0..3 {
        assert_eq!(stream.read(&mut buf, StreamFlags::DEFAULT).expect("读取"), 0);
    }
    assert_eq!(script.lock().received, b"secret", "密文已交给引擎");
    assert_eq!(stream.state(), TlsState::Handshaking);

    script.lock().handshaking = false;
    let n = stream.read(&mut buf, StreamFlags::DEFAULT).expect("握手完成后读取");
    assert_eq!(&buf[..n], b"secret");
    assert_eq!(stream.state(), TlsState::Established);
    assert_eq!(drain_pipe(&mut peer), b"early data", "握手完成时发出暂存明文");

    let script = script.lock();
    assert_eq!(script.encrypt_while_handshaking, 0);
    assert_eq!(script.decrypt_while_handshaking, 0);
}

#[test]
fn blocked_lower_stream_queues_then_flush_drains() {
    let Scripted {
        mut stream,
        mut peer,
        gate,
        ..
    } = scripted_client(Script::default(), 16);
    assert_eq!(stream.state(), TlsState::Established);

    let payload = sample(1_000, 9);
    gate.store(true, Ordering::SeqCst);
    let written = stream.write(&payload, StreamFlags::DEFAULT).expect("背压下写入成功");
    assert_eq!(written, payload.len(), "写入被完整接纳并排队");
    assert_eq!(
        stream.staged_plaintext() + stream.queued_ciphertext(),
        payload.len()
    );
    for _ in 0..50 {
        stream.flush(StreamFlags::DEFAULT).expect("阻塞期间 flush 不报错");
    }
    assert!(drain_pipe(&mut peer).is_empty());

    gate.store(false, Ordering::SeqCst);
    let mut received = Vec::new();
    for _ in 0..1_000 {
        stream.flush(StreamFlags::DEFAULT).expect("flush");
        received.extend(drain_pipe(&mut peer));
        if received.len() == payload.len() {
            break;
        }
    }
    assert_eq!(received, payload);
    assert_eq!(stream.queued_ciphertext(), 0);
}

#[test]
fn full_stage_stops_accepting_when_engine_refuses() {
    let Scripted { mut stream, .. } = scripted_client(
        Script {
            encrypt_limit: Some(0),
            ..Script::default()
        },
        64,
    );
    let payload = sample(1_000, 1);
    let written = stream.write(&payload, StreamFlags::DEFAULT).expect("写入");
    assert_eq!(written, ENCRYPT_STAGE_CAPACITY);
    assert_eq!(stream.write(&payload, StreamFlags::DEFAULT).expect("再次写入"), 0);
}

#[test]
fn refused_ciphertext_is_kept_in_order() {
    let Scripted {
        mut stream,
        mut peer,
        script,
        ..
    } = scripted_client(
        Script {
            push_limit: Some(3),
            ..Script::default()
        },
        1024,
    );
    let payload = sample(200, 77);
    peer.write(&payload, StreamFlags::DEFAULT).expect("对端写入");

    let mut received = Vec::new();
    let mut buf = [0u8; 8];
    for _ in 0..500 {
        let n = stream.read(&mut buf, StreamFlags::DEFAULT).expect("读取");
        received.extend_from_slice(&buf[..n]);
        if received.len() == payload.len() {
            break;
        }
    }
    assert_eq!(received, payload);
    assert_eq!(script.lock().received, payload);
}

#[test]
fn read_flushes_engine_output_immediately() {
    let Scripted {
        mut stream,
        mut peer,
        ..
    } = scripted_client(
        Script {
            reply_on_decrypt: b"key-update".to_vec(),
            ..Script::default()
        },
        1024,
    );
    peer.write(b"ping", StreamFlags::DEFAULT).expect("对端写入");
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf, StreamFlags::DEFAULT).expect("读取");
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(drain_pipe(&mut peer), b"key-update", "无需 flush 即已发出");
}

#[test]
#[traced_test]
fn engine_failure_is_sticky_and_logged_once() {
    let Scripted {
        mut stream,
        mut peer,
        script,
        ..
    } = scripted_client(
        Script {
            handshaking: true,
            ..Script::default()
        },
        1024,
    );
    script.lock().fail_on_push = true;
    peer.write(b"garbage", StreamFlags::DEFAULT).expect("对端写入");

    let mut buf = [0u8; 16];
    let first = stream
        .read(&mut buf, StreamFlags::DEFAULT)
        .expect_err("引擎失败");
    assert_eq!(first.status(), Status::Failed);
    assert_eq!(stream.state(), TlsState::Failed);

    script.lock().fail_on_push = false;
    let again = stream
        .read(&mut buf, StreamFlags::DEFAULT)
        .expect_err("失败状态粘滞");
    let write = stream
        .write(b"x", StreamFlags::DEFAULT)
        .expect_err("失败后写入");
    let flush = stream.flush(StreamFlags::DEFAULT).expect_err("失败后 flush");
    for err in [&again, &write, &flush] {
        assert_eq!(err.status(), first.status());
        assert_eq!(err.code(), first.code());
        assert_eq!(err.message(), first.message());
    }
    logs_assert(|lines: &[&str]| {
        match lines.iter().filter(|line| line.contains("tls pump failed")).count() {
            1 => Ok(()),
            n => Err(format!("失败日志应只出现一次，实际 {n} 次")),
        }
    });

    stream.close().expect("失败后仍可关闭");
    assert_eq!(script.lock().close_notify_sent, 0, "失败会话不发送 close_notify");
}

#[test]
fn close_is_idempotent_and_closes_lower_stream() {
    let Scripted {
        mut stream,
        mut peer,
        script,
        ..
    } = scripted_client(Script::default(), 1024);
    stream.write(b"tail", StreamFlags::DEFAULT).expect("暂存");

    stream.close().expect("关闭");
    stream.close().expect("重复关闭为空操作");
    assert_eq!(stream.state(), TlsState::Closed);
    assert_eq!(script.lock().close_notify_sent, 1);
    assert_eq!(drain_pipe(&mut peer), b"tail<close_notify>");

    let mut buf = [0u8; 4];
    let err = peer
        .read(&mut buf, StreamFlags::DEFAULT)
        .expect_err("下层已关闭");
    assert_eq!(err.status(), Status::StreamClosed);
    let err = stream
        .read(&mut buf, StreamFlags::DEFAULT)
        .expect_err("关闭后读取");
    assert_eq!(err.status(), Status::HandleClosed);
}

#[test]
fn server_waits_for_first_read_to_start_handshake() {
    let (engine, script) = ScriptedEngine::new(Script {
        handshaking: true,
        outbound: b"server-hello".iter().copied().collect(),
        ..Script::default()
    });
    let (near, mut peer) = pipe_pair(1024);
    let mut server = TlsStream::server(Box::new(near), Box::new(engine), StreamFlags::DEFAULT);
    assert_eq!(server.state(), TlsState::Init);
    assert!(drain_pipe(&mut peer).is_empty());

    let mut buf = [0u8; 8];
    assert_eq!(server.read(&mut buf, StreamFlags::DEFAULT).expect("读取"), 0);
    assert_eq!(server.state(), TlsState::Handshaking);
    assert_eq!(drain_pipe(&mut peer), b"server-hello");
    assert!(script.lock().outbound.is_empty());
}

#[test]
#[traced_test]
fn lower_stream_reset_is_sticky_and_not_reported_as_tls_failure() {
    let (engine, _script) = ScriptedEngine::new(Script::default());
    let (near, _peer) = pipe_pair(1024);
    let reset = near.reset_switch();
    let mut stream = TlsStream::client(Box::new(near), Box::new(engine), StreamFlags::DEFAULT)
        .expect("脚本化客户端");
    assert_eq!(stream.state(), TlsState::Established);

    reset.store(true, Ordering::SeqCst);
    let first = stream
        .write(&[7u8; 300], StreamFlags::DEFAULT)
        .expect_err("下层复位");
    assert_eq!(first.status(), Status::ConnectionReset);
    assert_eq!(first.code(), "spark.transport.test.pipe_reset");
    assert_eq!(stream.state(), TlsState::Failed);

    let again = stream
        .read(&mut [0u8; 8], StreamFlags::DEFAULT)
        .expect_err("失败状态粘滞");
    assert_eq!(again.status(), Status::ConnectionReset);
    assert_eq!(again.message(), first.message());

    logs_assert(|lines: &[&str]| {
        let warned = lines.iter().filter(|line| line.contains("tls pump failed")).count();
        let stopped = lines
            .iter()
            .filter(|line| line.contains("tls pump stopped by lower stream"))
            .count();
        match (warned, stopped) {
            (0, 1) => Ok(()),
            other => Err(format!("下层错误应只记录一次 debug 日志，实际 {other:?}")),
        }
    });
}

#[test]
fn failed_first_handshake_step_closes_lower_stream() {
    let (engine, _script) = ScriptedEngine::new(Script {
        handshaking: true,
        outbound: b"client-hello".iter().copied().collect(),
        ..Script::default()
    });
    let (near, mut peer) = pipe_pair(1024);
    near.reset_switch().store(true, Ordering::SeqCst);

    let err = TlsStream::client(Box::new(near), Box::new(engine), StreamFlags::DEFAULT)
        .err()
        .expect("首步握手写入失败");
    assert_eq!(err.status(), Status::ConnectionReset);

    let mut buf = [0u8; 8];
    let closed = peer
        .read(&mut buf, StreamFlags::DEFAULT)
        .expect_err("下层应已关闭");
    assert_eq!(closed.status(), Status::StreamClosed);
}

#[test]
fn accepted_streams_inherit_listener_flags_without_listen() {
    let (near, _peer) = pipe_pair(1024);
    let mut listener = TlsListener::new(
        Box::new(PipeListener::new([near])),
        localhost_context(),
        StreamFlags::LISTEN | StreamFlags::TCP_NODELAY,
    );

    let accepted = listener
        .accept(StreamFlags::WAIT)
        .expect("接受")
        .expect("有待接受的连接");
    assert_eq!(accepted.stream.header().open_flags, StreamFlags::TCP_NODELAY);
    assert!(accepted.remote.is_none());
    assert!(listener.accept(StreamFlags::DEFAULT).expect("接受").is_none());
}
