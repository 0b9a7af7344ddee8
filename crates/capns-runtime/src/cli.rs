//! The plugin binary's command-line surface.
//!
//! Invoked with no arguments, the plugin speaks the wire protocol on
//! stdio (the mode the host uses when it spawns the binary). Otherwise:
//!
//! - `manifest` prints the manifest as JSON;
//! - `--help` lists commands, `<command> --help` lists its arguments;
//! - `<command> [args…]` translates CLI arguments into the same
//!   stream-of-arguments encoding used on the wire, runs the handler
//!   in-process over a loopback transport, writes emitted values to
//!   stdout and LOG frames to stderr, and exits non-zero on any ERR.

use std::collections::HashMap;
use std::fmt;
use std::io::Write as _;
use std::process::ExitCode;

use bytes::Bytes;
use capns_wire::{
    handshake, read_frame, write_frame, ArgSource, CapDecl, Frame, FrameType, Limits, Manifest,
    MessageId,
};
use tokio::io::AsyncReadExt;

use crate::{validate_args, PluginRuntime};

/// Errors while binding CLI tokens to declared arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BindError {
    FlagNeedsValue(String),
    UnknownFlag(String),
    MissingRequired { index: usize, sources: String },
    /// An earlier optional argument was omitted while a later one was
    /// provided; positional binding would silently shift.
    Gap { omitted: usize, provided: usize },
    /// Binding needs stdin; the caller reads it and retries.
    StdinNeeded,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::FlagNeedsValue(name) => write!(f, "flag --{name} needs a value"),
            BindError::UnknownFlag(name) => write!(f, "unknown flag --{name}"),
            BindError::MissingRequired { index, sources } => {
                write!(f, "required argument {index} missing (accepted via {sources})")
            }
            BindError::Gap { omitted, provided } => write!(
                f,
                "argument {omitted} omitted while argument {provided} was provided"
            ),
            BindError::StdinNeeded => write!(f, "argument expects stdin"),
        }
    }
}

/// Split raw tokens into `--flag value` / `--flag=value` pairs and
/// positionals.
fn split_tokens(tokens: &[String]) -> Result<(HashMap<String, String>, Vec<String>), BindError> {
    let mut flags = HashMap::new();
    let mut positionals = Vec::new();
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        if let Some(name) = token.strip_prefix("--") {
            if let Some((name, value)) = name.split_once('=') {
                flags.insert(name.to_string(), value.to_string());
            } else {
                let value = iter
                    .next()
                    .ok_or_else(|| BindError::FlagNeedsValue(name.to_string()))?;
                flags.insert(name.to_string(), value.clone());
            }
        } else {
            positionals.push(token.clone());
        }
    }
    Ok((flags, positionals))
}

/// Bind CLI tokens to the declared arguments, in declaration order.
///
/// Returns `(media_urn, value)` pairs ready for the wire encoding. When a
/// still-unbound argument lists stdin as a source and `stdin` is `None`,
/// fails with [`BindError::StdinNeeded`] so the caller can read stdin
/// exactly once and retry.
fn bind_args(
    decl: &CapDecl,
    tokens: &[String],
    stdin: Option<&Bytes>,
) -> Result<Vec<(String, Bytes)>, BindError> {
    let (flags, positionals) = split_tokens(tokens)?;

    // reject flags no argument declares
    for name in flags.keys() {
        let known = decl.args.iter().any(|arg| {
            arg.sources
                .iter()
                .any(|s| matches!(s, ArgSource::Flag(flag) if flag == name))
        });
        if !known {
            return Err(BindError::UnknownFlag(name.clone()));
        }
    }

    let mut bound: Vec<Option<(String, Bytes)>> = Vec::with_capacity(decl.args.len());
    let mut stdin_used = false;
    for arg in &decl.args {
        let mut value: Option<Bytes> = None;
        for source in &arg.sources {
            match source {
                ArgSource::Flag(name) => {
                    if let Some(v) = flags.get(name) {
                        value = Some(Bytes::from(v.clone()));
                        break;
                    }
                }
                ArgSource::Positional(index) => {
                    if let Some(v) = positionals.get(*index as usize) {
                        value = Some(Bytes::from(v.clone()));
                        break;
                    }
                }
                ArgSource::Stdin => {
                    if stdin_used {
                        continue;
                    }
                    match stdin {
                        Some(bytes) => {
                            stdin_used = true;
                            value = Some(bytes.clone());
                        }
                        None => return Err(BindError::StdinNeeded),
                    }
                    break;
                }
            }
        }
        bound.push(value.map(|v| (arg.media_urn.to_string(), v)));
    }

    // trailing omissions are fine, gaps are not
    let mut args = Vec::new();
    let mut first_gap = None;
    for (index, slot) in bound.into_iter().enumerate() {
        match (slot, first_gap) {
            (Some(_), Some(omitted)) => {
                return Err(BindError::Gap {
                    omitted,
                    provided: index,
                })
            }
            (Some(pair), None) => args.push(pair),
            (None, _) => {
                let arg = &decl.args[index];
                if arg.required {
                    let sources = arg
                        .sources
                        .iter()
                        .map(|s| s.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(BindError::MissingRequired { index, sources });
                }
                first_gap.get_or_insert(index);
            }
        }
    }
    Ok(args)
}

fn print_usage(manifest: &Manifest) {
    println!("{} {}", manifest.name, manifest.version);
    if let Some(description) = &manifest.description {
        println!("{description}");
    }
    println!();
    println!("Usage: {} [<command> [args...] | manifest]", manifest.name);
    println!();
    println!("Commands:");
    for cap in &manifest.caps {
        println!("  {:<18} {}", cap.command, cap.title);
    }
    println!();
    println!("With no arguments the plugin speaks the wire protocol on stdio.");
    println!("Run '{} <command> --help' for that command's arguments.", manifest.name);
}

fn print_command_help(decl: &CapDecl) {
    println!("{} ({})", decl.command, decl.urn);
    if let Some(description) = &decl.description {
        println!("{description}");
    }
    println!();
    if decl.args.is_empty() {
        println!("No arguments.");
        return;
    }
    println!("Arguments:");
    for (index, arg) in decl.args.iter().enumerate() {
        let sources = arg
            .sources
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let required = if arg.required { "required" } else { "optional" };
        println!("  {index}: {} ({required}, via {sources})", arg.media_urn);
        if let Some(description) = &arg.arg_description {
            println!("     {description}");
        }
    }
}

/// Entry point for plugin binaries. Reads `std::env::args()`.
pub async fn run_cli(runtime: PluginRuntime) -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    run_cli_with_args(runtime, args).await
}

async fn run_cli_with_args(runtime: PluginRuntime, args: Vec<String>) -> ExitCode {
    match args.split_first() {
        None => match runtime.run(tokio::io::stdin(), tokio::io::stdout()).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("fatal: {e}");
                ExitCode::FAILURE
            }
        },
        Some((first, rest)) => match first.as_str() {
            "manifest" => match serde_json::to_string_pretty(runtime.manifest()) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("manifest error: {e}");
                    ExitCode::FAILURE
                }
            },
            "--help" | "-h" => {
                print_usage(runtime.manifest());
                ExitCode::SUCCESS
            }
            command => run_command(runtime, command, rest).await,
        },
    }
}

async fn run_command(runtime: PluginRuntime, command: &str, rest: &[String]) -> ExitCode {
    let Some(decl) = runtime.manifest().find_command(command).cloned() else {
        eprintln!("unknown command {command:?}; try --help");
        return ExitCode::from(2);
    };

    if rest.iter().any(|t| t == "--help" || t == "-h") {
        print_command_help(&decl);
        return ExitCode::SUCCESS;
    }

    let args = match bind_args(&decl, rest, None) {
        Ok(args) => args,
        Err(BindError::StdinNeeded) => {
            let mut buffer = Vec::new();
            if let Err(e) = tokio::io::stdin().read_to_end(&mut buffer).await {
                eprintln!("reading stdin: {e}");
                return ExitCode::from(2);
            }
            match bind_args(&decl, rest, Some(&Bytes::from(buffer))) {
                Ok(args) => args,
                Err(e) => {
                    eprintln!("{e}");
                    return ExitCode::from(2);
                }
            }
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = validate_args(&decl, &args) {
        eprintln!("{e}");
        return ExitCode::from(2);
    }

    execute_in_process(runtime, &decl, args).await
}

/// Run one request against the runtime over a loopback transport, using
/// the same frame sequence the wire would carry.
async fn execute_in_process(
    runtime: PluginRuntime,
    decl: &CapDecl,
    args: Vec<(String, Bytes)>,
) -> ExitCode {
    let (engine_side, plugin_side) = tokio::io::duplex(64 * 1024);
    let (plugin_r, plugin_w) = tokio::io::split(plugin_side);
    let runtime_task = tokio::spawn(runtime.run(plugin_r, plugin_w));

    let (mut reader, mut writer) = tokio::io::split(engine_side);
    let outcome = match handshake::initiate(
        &mut reader,
        &mut writer,
        Bytes::new(),
        Limits::default(),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("loopback handshake failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    let limits = outcome.limits;

    let id = MessageId::random();
    let mut frames = vec![Frame::req(id, decl.urn.to_string())];
    for (index, (media_urn, value)) in args.iter().enumerate() {
        let stream_id = format!("arg-{index}");
        frames.push(Frame::stream_start(id, stream_id.clone(), media_urn.clone()));
        let max_chunk = limits.max_chunk as usize;
        let mut chunk_index = 0u64;
        let mut offset = 0;
        loop {
            let end = (offset + max_chunk).min(value.len());
            frames.push(Frame::chunk(
                id,
                stream_id.clone(),
                chunk_index,
                value.slice(offset..end),
            ));
            chunk_index += 1;
            offset = end;
            if offset >= value.len() {
                break;
            }
        }
        frames.push(Frame::stream_end(id, stream_id, chunk_index));
    }
    frames.push(Frame::end(id));

    for frame in &frames {
        if let Err(e) = write_frame(&mut writer, frame, limits.max_frame).await {
            eprintln!("sending request: {e}");
            return ExitCode::FAILURE;
        }
    }

    // consume the response: values to stdout, logs to stderr
    let code = loop {
        match read_frame(&mut reader, limits.max_frame).await {
            Ok(Some(frame)) => match frame.frame_type {
                FrameType::Chunk => {
                    if let Some(payload) = &frame.payload {
                        let mut stdout = std::io::stdout().lock();
                        if stdout.write_all(payload).is_err() {
                            break ExitCode::FAILURE;
                        }
                    }
                }
                FrameType::Log => {
                    let level = frame
                        .meta
                        .as_ref()
                        .and_then(|m| m.get("level").cloned())
                        .unwrap_or_else(|| "info".to_string());
                    eprintln!("[{level}] {}", frame.err_message().unwrap_or(""));
                }
                FrameType::Err => {
                    eprintln!(
                        "error {}: {}",
                        frame
                            .err_code()
                            .map(|c| c.as_str().to_string())
                            .unwrap_or_else(|| "UNKNOWN".to_string()),
                        frame.err_message().unwrap_or("")
                    );
                    break ExitCode::FAILURE;
                }
                FrameType::End => {
                    let _ = std::io::stdout().flush();
                    break ExitCode::SUCCESS;
                }
                FrameType::Req => {
                    // a peer invocation with nothing to route it
                    let reply = Frame::err(
                        frame.id,
                        capns_wire::ErrorCode::NoHandler,
                        "peer invocation is not available in CLI mode",
                    );
                    if let Err(e) = write_frame(&mut writer, &reply, limits.max_frame).await {
                        eprintln!("answering peer invocation: {e}");
                        break ExitCode::FAILURE;
                    }
                }
                _ => {}
            },
            Ok(None) => {
                eprintln!("plugin closed before the response completed");
                break ExitCode::FAILURE;
            }
            Err(e) => {
                eprintln!("reading response: {e}");
                break ExitCode::FAILURE;
            }
        }
    };

    // closing our side lets the runtime drain and exit
    drop(reader);
    drop(writer);
    let _ = runtime_task.await;
    code
}
