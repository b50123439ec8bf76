//! tricklectl: control client for the trickled daemon
//!
//! Talks to the daemon's Unix control socket. Currently carries a single
//! subcommand, wired into the router firmware's `netfilter.d` convention:
//!
//! ```bash
//! tricklectl hook netfilter.d --type iptables --table mangle
//! ```

use anyhow::{bail, Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use trickle_router::paths;

struct HookArgs {
    kind: String,
    table: String,
}

fn parse_args() -> Result<HookArgs> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("hook") => {}
        Some("-h" | "--help") | None => {
            print_help();
            std::process::exit(0);
        }
        Some(other) => bail!("unknown command: {other}"),
    }
    if args.get(1).map(String::as_str) != Some("netfilter.d") {
        bail!("unknown hook; expected: hook netfilter.d");
    }

    let mut kind = String::new();
    let mut table = String::new();
    let mut iter = args[2..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--type" => kind = iter.next().cloned().unwrap_or_default(),
            "--table" => table = iter.next().cloned().unwrap_or_default(),
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(HookArgs { kind, table })
}

fn print_help() {
    println!(
        "tricklectl v{}

USAGE:
    tricklectl hook netfilter.d --type <type> --table <table>

Posts a netfilter.d notification to the running daemon so it re-asserts
its firewall rules. <type> is one of \"\", iptables, ip6tables, ip4tables;
<table> one of \"\", filter, nat, mangle.",
        trickle_router::VERSION
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let stream = UnixStream::connect(paths::CONTROL_SOCKET)
        .await
        .with_context(|| format!("failed to connect to {}", paths::CONTROL_SOCKET))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("http handshake failed")?;
    tokio::spawn(conn);

    let body = serde_json::json!({ "type": args.kind, "table": args.table }).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/system/hooks/netfilterd")
        .header("host", "localhost")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))?;

    let response = sender.send_request(request).await.context("request failed")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.into_body().collect().await?.to_bytes();
        bail!(
            "daemon rejected the hook ({status}): {}",
            String::from_utf8_lossy(&body)
        );
    }
    Ok(())
}
