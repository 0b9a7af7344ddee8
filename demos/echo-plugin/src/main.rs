//! Demo plugin exercising the runtime surface end to end.
//!
//! Three capabilities: `echo` returns its argument verbatim, `upper`
//! uppercases a string, and `chain` peer-invokes `upper` through the
//! host. Run with no arguments under a host, or directly:
//!
//! ```text
//! echo-plugin manifest
//! echo-plugin upper --text "hello"
//! echo 'hello' | echo-plugin echo
//! ```

use std::process::ExitCode;

use bytes::Bytes;
use capns::wire::{ArgDecl, ArgSource, CapDecl, OutputDecl};
use capns::{HandlerFailure, LogLevel, Manifest, PeerArg, PluginRuntime};

fn manifest() -> Manifest {
    let mut manifest = Manifest::new("echo-plugin", env!("CARGO_PKG_VERSION"));
    manifest.description = Some("demo plugin: echo, uppercase, peer-invoked chain".to_string());

    manifest.caps.push(CapDecl {
        urn: "cap:op=echo".parse().unwrap(),
        title: "echo the input back".to_string(),
        description: None,
        command: "echo".to_string(),
        args: vec![ArgDecl {
            media_urn: "media:binary".parse().unwrap(),
            required: true,
            sources: vec![ArgSource::Positional(0), ArgSource::Stdin],
            arg_description: Some("bytes to echo".to_string()),
        }],
        output: Some(OutputDecl {
            media_urn: "media:binary".parse().unwrap(),
            description: None,
        }),
        metadata: Default::default(),
    });

    manifest.caps.push(CapDecl {
        urn: "cap:op=upper;in=\"media:string\"".parse().unwrap(),
        title: "uppercase a string".to_string(),
        description: None,
        command: "upper".to_string(),
        args: vec![ArgDecl {
            media_urn: "media:string".parse().unwrap(),
            required: true,
            sources: vec![
                ArgSource::Flag("text".to_string()),
                ArgSource::Positional(0),
                ArgSource::Stdin,
            ],
            arg_description: Some("text to uppercase".to_string()),
        }],
        output: Some(OutputDecl {
            media_urn: "media:string".parse().unwrap(),
            description: None,
        }),
        metadata: Default::default(),
    });

    manifest.caps.push(CapDecl {
        urn: "cap:op=chain".parse().unwrap(),
        title: "uppercase via a peer invocation".to_string(),
        description: Some("demonstrates plugin-to-plugin calls through the host".to_string()),
        command: "chain".to_string(),
        args: vec![ArgDecl {
            media_urn: "media:string".parse().unwrap(),
            required: true,
            sources: vec![ArgSource::Positional(0), ArgSource::Stdin],
            arg_description: Some("text to pass along".to_string()),
        }],
        output: Some(OutputDecl {
            media_urn: "media:string".parse().unwrap(),
            description: None,
        }),
        metadata: Default::default(),
    });

    manifest
}

fn build_runtime() -> PluginRuntime {
    let mut runtime = PluginRuntime::new(manifest());

    runtime
        .register_fn("cap:op=echo".parse().unwrap(), |mut req, out, _peer| async move {
            for (_media, value) in req.collect_args().await {
                out.emit_value(value)
                    .await
                    .map_err(|e| HandlerFailure::new(e.to_string()))?;
            }
            Ok(())
        })
        .expect("register echo");

    runtime
        .register_fn(
            "cap:op=upper;in=\"media:string\"".parse().unwrap(),
            |mut req, out, _peer| async move {
                let args = req.collect_args().await;
                let (_media, value) = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| HandlerFailure::new("upper expects one argument"))?;
                let text = std::str::from_utf8(&value)
                    .map_err(|_| HandlerFailure::new("input is not UTF-8"))?;
                out.emit_text(text.to_uppercase())
                    .await
                    .map_err(|e| HandlerFailure::new(e.to_string()))
            },
        )
        .expect("register upper");

    runtime
        .register_fn("cap:op=chain".parse().unwrap(), |mut req, out, peer| async move {
            let args = req.collect_args().await;
            let (_media, value) = args
                .into_iter()
                .next()
                .ok_or_else(|| HandlerFailure::new("chain expects one argument"))?;
            out.emit_log(LogLevel::Info, "chaining through cap:op=upper")
                .await
                .map_err(|e| HandlerFailure::new(e.to_string()))?;
            let response = peer
                .invoke(
                    &"cap:op=upper".parse().unwrap(),
                    vec![PeerArg::new("media:string", Bytes::from(value.to_vec()))],
                )
                .await
                .map_err(|e| HandlerFailure::new(e.to_string()))?;
            let upper = response
                .collect_value()
                .await
                .map_err(|e| HandlerFailure::new(e.to_string()))?;
            out.emit_value(upper)
                .await
                .map_err(|e| HandlerFailure::new(e.to_string()))
        })
        .expect("register chain");

    runtime
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    capns::runtime::run_cli(build_runtime()).await
}
