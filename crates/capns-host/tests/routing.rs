//! Host routing tests: a real engine driver on one side, real plugin
//! runtimes (or scripted fake plugins) on the other.

use std::time::Duration;

use bytes::Bytes;
use capns_host::{HostError, PluginHost, RelaySlave};
use capns_runtime::{HandlerFailure, PeerArg, PluginRuntime};
use capns_wire::{
    handshake, read_frame, write_frame, CapDecl, ErrorCode, Frame, FrameType, Limits, Manifest,
    MessageId,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

fn manifest(name: &str, caps: &[(&str, &str)]) -> Manifest {
    let mut manifest = Manifest::new(name, "0.0.0");
    for (urn, command) in caps {
        manifest.caps.push(CapDecl {
            urn: urn.parse().unwrap(),
            title: command.to_string(),
            description: None,
            command: command.to_string(),
            args: Vec::new(),
            output: None,
            metadata: Default::default(),
        });
    }
    manifest
}

/// A runtime echoing every argument back, advertising `urn`.
fn echo_runtime(name: &str, urn: &str) -> PluginRuntime {
    let mut runtime = PluginRuntime::new(manifest(name, &[(urn, "echo")]));
    runtime
        .register_fn(urn.parse().unwrap(), |mut req, out, _peer| async move {
            for (_media, value) in req.collect_args().await {
                out.emit_value(value)
                    .await
                    .map_err(|e| HandlerFailure::new(e.to_string()))?;
            }
            Ok(())
        })
        .unwrap();
    runtime
}

async fn attach_runtime(host: &mut PluginHost, runtime: PluginRuntime) {
    let (host_side, plugin_side) = tokio::io::duplex(64 * 1024);
    let (plugin_r, plugin_w) = tokio::io::split(plugin_side);
    tokio::spawn(runtime.run(plugin_r, plugin_w));
    let (host_r, host_w) = tokio::io::split(host_side);
    host.attach_plugin(host_r, host_w).await.unwrap();
}

struct EngineDriver {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    limits: Limits,
}

impl EngineDriver {
    async fn start(host: PluginHost) -> (Self, JoinHandle<Result<(), HostError>>) {
        let (engine_side, host_side) = tokio::io::duplex(64 * 1024);
        let (host_r, host_w) = tokio::io::split(host_side);
        let task = tokio::spawn(host.run(host_r, host_w));

        let (mut reader, mut writer) = tokio::io::split(engine_side);
        let outcome =
            handshake::initiate(&mut reader, &mut writer, Bytes::new(), Limits::default())
                .await
                .expect("engine handshake");
        (
            EngineDriver {
                reader,
                writer,
                limits: outcome.limits,
            },
            task,
        )
    }

    async fn send(&mut self, frame: Frame) {
        write_frame(&mut self.writer, &frame, self.limits.max_frame)
            .await
            .expect("send");
    }

    async fn recv(&mut self) -> Frame {
        read_frame(&mut self.reader, self.limits.max_frame)
            .await
            .expect("read")
            .expect("unexpected EOF")
    }

    async fn send_simple_request(&mut self, id: MessageId, cap: &str, payload: &[u8]) {
        self.send(Frame::req(id, cap)).await;
        self.send(Frame::stream_start(id, "a", "media:binary")).await;
        self.send(Frame::chunk(id, "a", 0, Bytes::copy_from_slice(payload)))
            .await;
        self.send(Frame::stream_end(id, "a", 1)).await;
        self.send(Frame::end(id)).await;
    }

    /// Read frames for `id` until its terminal; concatenated chunks on
    /// END, code and message on ERR.
    async fn collect_response(&mut self, id: MessageId) -> Result<Vec<u8>, (ErrorCode, String)> {
        let mut value = Vec::new();
        loop {
            let frame = self.recv().await;
            if frame.id != id {
                continue;
            }
            match frame.frame_type {
                FrameType::Chunk => value.extend_from_slice(frame.payload.as_deref().unwrap()),
                FrameType::End => return Ok(value),
                FrameType::Err => {
                    return Err((
                        frame.err_code().expect("code"),
                        frame.err_message().unwrap_or("").to_string(),
                    ))
                }
                _ => {}
            }
        }
    }
}

#[tokio::test]
async fn routes_request_to_attached_plugin() {
    let mut host = PluginHost::new("fabric", Limits::default());
    attach_runtime(&mut host, echo_runtime("echo", "cap:op=echo")).await;
    let (mut engine, _task) = EngineDriver::start(host).await;

    let id = MessageId::from_u64(1);
    engine.send_simple_request(id, "cap:op=echo", b"ping").await;
    let value = engine.collect_response(id).await.unwrap();
    assert_eq!(value, b"ping");
}

#[tokio::test]
async fn aggregate_manifest_reaches_the_engine() {
    let mut host = PluginHost::new("fabric", Limits::default());
    attach_runtime(&mut host, echo_runtime("alpha", "cap:op=alpha")).await;
    attach_runtime(&mut host, echo_runtime("beta", "cap:op=beta")).await;

    let (engine_side, host_side) = tokio::io::duplex(64 * 1024);
    let (host_r, host_w) = tokio::io::split(host_side);
    let _task = tokio::spawn(host.run(host_r, host_w));
    let (mut reader, mut writer) = tokio::io::split(engine_side);
    let outcome = handshake::initiate(&mut reader, &mut writer, Bytes::new(), Limits::default())
        .await
        .unwrap();

    let aggregate = Manifest::from_bytes(&outcome.peer_manifest).unwrap();
    let urns: Vec<String> = aggregate.caps.iter().map(|c| c.urn.to_string()).collect();
    assert!(urns.contains(&"cap:op=alpha".to_string()));
    assert!(urns.contains(&"cap:op=beta".to_string()));
}

#[tokio::test]
async fn unmatched_cap_gets_no_handler() {
    let mut host = PluginHost::new("fabric", Limits::default());
    attach_runtime(&mut host, echo_runtime("echo", "cap:op=echo")).await;
    let (mut engine, _task) = EngineDriver::start(host).await;

    let id = MessageId::from_u64(2);
    engine.send(Frame::req(id, "cap:op=transmogrify")).await;
    let (code, _message) = engine.collect_response(id).await.unwrap_err();
    assert_eq!(code, ErrorCode::NoHandler);
}

#[tokio::test]
async fn req_with_payload_rejected_at_the_host() {
    let mut host = PluginHost::new("fabric", Limits::default());
    attach_runtime(&mut host, echo_runtime("echo", "cap:op=echo")).await;
    let (mut engine, _task) = EngineDriver::start(host).await;

    let id = MessageId::from_u64(3);
    let mut req = Frame::req(id, "cap:op=echo");
    req.payload = Some(Bytes::from_static(b"inline"));
    engine.send(req).await;
    let (code, message) = engine.collect_response(id).await.unwrap_err();
    assert_eq!(code, ErrorCode::ProtocolError);
    assert!(message.contains("payload"));
}

#[tokio::test]
async fn heartbeat_answered_by_the_host() {
    let mut host = PluginHost::new("fabric", Limits::default());
    attach_runtime(&mut host, echo_runtime("echo", "cap:op=echo")).await;
    let (mut engine, _task) = EngineDriver::start(host).await;

    let id = MessageId::from_u64(4);
    engine.send(Frame::heartbeat(id)).await;
    let beat = engine.recv().await;
    assert_eq!(beat.frame_type, FrameType::Heartbeat);
    assert_eq!(beat.id, id);
}

#[tokio::test]
async fn unknown_continuation_gets_unknown_request() {
    let host = PluginHost::new("fabric", Limits::default());
    let (mut engine, _task) = EngineDriver::start(host).await;

    let id = MessageId::from_u64(5);
    engine
        .send(Frame::chunk(id, "a", 0, Bytes::from_static(b"x")))
        .await;
    let err = engine.recv().await;
    assert_eq!(err.err_code(), Some(ErrorCode::UnknownRequest));
}

#[tokio::test]
async fn spawn_failure_poisons_the_endpoint() {
    let mut host = PluginHost::new("fabric", Limits::default());
    host.register_plugin(
        "/nonexistent/capns-test-plugin",
        vec!["cap:op=ghost".parse().unwrap()],
    );
    let (mut engine, _task) = EngineDriver::start(host).await;

    let id = MessageId::from_u64(6);
    engine.send(Frame::req(id, "cap:op=ghost")).await;
    let (code, _message) = engine.collect_response(id).await.unwrap_err();
    assert_eq!(code, ErrorCode::SpawnFailed);

    // poisoned: the second attempt fails without another spawn
    let id = MessageId::from_u64(7);
    engine.send(Frame::req(id, "cap:op=ghost")).await;
    let (code, message) = engine.collect_response(id).await.unwrap_err();
    assert_eq!(code, ErrorCode::SpawnFailed);
    assert!(message.contains("poisoned"));
}

#[tokio::test]
async fn endpoint_death_cascades_and_the_rest_survives() {
    let mut host = PluginHost::new("fabric", Limits::default());

    // a scripted plugin for cap:op=a that dies after reading the request
    let (host_side, plugin_side) = tokio::io::duplex(64 * 1024);
    let dying_plugin = tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(plugin_side);
        let outcome = handshake::accept(
            &mut reader,
            &mut writer,
            manifest("dying", &[("cap:op=a", "a")]).to_bytes().unwrap(),
            Limits::default(),
        )
        .await
        .unwrap();
        // consume the request, then drop the transport mid-request
        loop {
            let frame = read_frame(&mut reader, outcome.limits.max_frame)
                .await
                .unwrap()
                .unwrap();
            if frame.frame_type == FrameType::End {
                break;
            }
        }
    });
    let (host_r, host_w) = tokio::io::split(host_side);
    host.attach_plugin(host_r, host_w).await.unwrap();

    attach_runtime(&mut host, echo_runtime("b", "cap:op=b")).await;
    let (mut engine, _task) = EngineDriver::start(host).await;

    // in-flight request on the dying endpoint
    let id_a = MessageId::from_u64(8);
    engine.send(Frame::req(id_a, "cap:op=a")).await;
    engine.send(Frame::end(id_a)).await;
    let (code, message) = engine.collect_response(id_a).await.unwrap_err();
    assert_eq!(code, ErrorCode::EndpointDied);
    assert!(message.contains("died"));
    dying_plugin.await.unwrap();

    // the sibling endpoint keeps serving
    let id_b = MessageId::from_u64(9);
    engine.send_simple_request(id_b, "cap:op=b", b"alive").await;
    assert_eq!(engine.collect_response(id_b).await.unwrap(), b"alive");

    // the dead endpoint's cap is no longer served
    let id_a2 = MessageId::from_u64(10);
    engine.send(Frame::req(id_a2, "cap:op=a")).await;
    let (code, _message) = engine.collect_response(id_a2).await.unwrap_err();
    assert_eq!(code, ErrorCode::NoHandler);
}

#[tokio::test]
async fn peer_invocation_crosses_plugins() {
    let mut host = PluginHost::new("fabric", Limits::default());

    let mut outer = PluginRuntime::new(manifest("outer", &[("cap:op=outer", "outer")]));
    outer
        .register_fn("cap:op=outer".parse().unwrap(), |_req, out, peer| async move {
            let response = peer
                .invoke(
                    &"cap:op=inner".parse().unwrap(),
                    vec![PeerArg::new("media:string", Bytes::from_static(b"x"))],
                )
                .await
                .map_err(|e| HandlerFailure::new(e.to_string()))?;
            let inner = response
                .collect_value()
                .await
                .map_err(|e| HandlerFailure::new(e.to_string()))?;
            let mut value = b"outer(".to_vec();
            value.extend_from_slice(&inner);
            value.push(b')');
            out.emit_value(Bytes::from(value))
                .await
                .map_err(|e| HandlerFailure::new(e.to_string()))?;
            Ok(())
        })
        .unwrap();
    attach_runtime(&mut host, outer).await;
    attach_runtime(&mut host, echo_runtime("inner", "cap:op=inner")).await;

    let (mut engine, _task) = EngineDriver::start(host).await;

    let id = MessageId::from_u64(11);
    engine.send(Frame::req(id, "cap:op=outer")).await;
    engine.send(Frame::end(id)).await;

    // the peer REQ stays inside the fabric; the engine only ever sees
    // frames for its own message id
    let value = engine.collect_response(id).await.unwrap();
    assert_eq!(value, b"outer(x)");
}

#[tokio::test]
async fn relay_pair_routes_and_carries_state() {
    // worker side: a slave host with one real plugin
    let mut slave_host = PluginHost::new("worker", Limits::default());
    attach_runtime(&mut slave_host, echo_runtime("echo", "cap:op=echo")).await;
    let slave = RelaySlave::new(slave_host);
    let state_handle = slave.host_state();

    // the master attaches the slave like any endpoint; the slave's HELLO
    // carries its aggregated manifest
    let (master_side, slave_side) = tokio::io::duplex(64 * 1024);
    let (slave_r, slave_w) = tokio::io::split(slave_side);
    tokio::spawn(slave.run(slave_r, slave_w));

    let mut master = PluginHost::new("engine", Limits::default());
    let master_handle = master.handle();
    let (master_r, master_w) = tokio::io::split(master_side);
    let slave_endpoint = master.attach_plugin(master_r, master_w).await.unwrap();

    let (mut engine, _task) = EngineDriver::start(master).await;

    // a request crosses both hops
    let id = MessageId::from_u64(12);
    engine.send_simple_request(id, "cap:op=echo", b"relayed").await;
    assert_eq!(engine.collect_response(id).await.unwrap(), b"relayed");

    // host-resource state flows master-to-slave, invisible to plugins
    assert!(
        master_handle
            .send_host_state(slave_endpoint, Bytes::from_static(b"resources"))
            .await
    );
    let mut state = None;
    for _ in 0..200 {
        state = state_handle.get();
        if state.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(state.as_deref(), Some(b"resources".as_slice()));
}

#[tokio::test]
async fn engine_end_does_not_orphan_the_response() {
    // a scripted plugin that only responds after seeing the engine's END
    let mut host = PluginHost::new("fabric", Limits::default());
    let (host_side, plugin_side) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(plugin_side);
        let outcome = handshake::accept(
            &mut reader,
            &mut writer,
            manifest("late", &[("cap:op=late", "late")]).to_bytes().unwrap(),
            Limits::default(),
        )
        .await
        .unwrap();
        let limits = outcome.limits;
        let mut req_id = None;
        loop {
            let frame = read_frame(&mut reader, limits.max_frame)
                .await
                .unwrap()
                .unwrap();
            if frame.frame_type == FrameType::Req {
                req_id = Some(frame.id);
            }
            if frame.frame_type == FrameType::End {
                break;
            }
        }
        // the routing entry must still exist for these frames
        let id = req_id.unwrap();
        write_frame(&mut writer, &Frame::stream_start(id, "out-0", "media:binary"), limits.max_frame).await.unwrap();
        write_frame(
            &mut writer,
            &Frame::chunk(id, "out-0", 0, Bytes::from_static(b"after-end")),
            limits.max_frame,
        )
        .await
        .unwrap();
        write_frame(&mut writer, &Frame::stream_end(id, "out-0", 1), limits.max_frame).await.unwrap();
        write_frame(&mut writer, &Frame::end(id), limits.max_frame).await.unwrap();
        // stay alive until the host is done
        let _ = read_frame(&mut reader, limits.max_frame).await;
    });
    let (host_r, host_w) = tokio::io::split(host_side);
    host.attach_plugin(host_r, host_w).await.unwrap();

    let (mut engine, _task) = EngineDriver::start(host).await;
    let id = MessageId::from_u64(13);
    engine.send(Frame::req(id, "cap:op=late")).await;
    engine.send(Frame::end(id)).await;
    assert_eq!(engine.collect_response(id).await.unwrap(), b"after-end");
}
