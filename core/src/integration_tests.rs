//! Round trips through a proxy, a transport and a remote kernel host

use std::sync::Arc;
use std::time::Duration;

use crate::contract::{
    EventPayload, FormattedValue, KernelCommand, KernelEvent, KernelUri, SubmitCode,
    TransportConfig, WireCodec,
};
use crate::kernel::{CompositeKernel, Kernel, KernelCommandResult, KernelHost, LocalKernel, ProxyKernel};
use crate::transport::{connected_pair, Connector};

fn uri(raw: &str) -> KernelUri {
    KernelUri::parse(raw).unwrap()
}

fn language_kernel(name: &str, language: &str) -> Arc<LocalKernel> {
    let kernel = LocalKernel::new(name).unwrap().with_language(language, "1.0");
    kernel.register_handler(SubmitCode::TYPE, |command, context| async move {
        // a submission addressed to one kernel keeps its selector line
        let code = command
            .code()
            .unwrap_or_default()
            .lines()
            .filter(|line| !line.trim_start().starts_with("#!"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        if code == "throw" {
            anyhow::bail!("Unhandled exception");
        }
        context.publish(KernelEvent::return_value(&command, FormattedValue::plain_text(code)));
        Ok(())
    });
    Arc::new(kernel)
}

struct Mesh {
    local: Arc<CompositeKernel>,
    proxy: Arc<ProxyKernel>,
    _local_host: KernelHost,
    _remote_host: KernelHost,
}

/// Local `.NET` composite with a javascript kernel and a proxy to the remote csharp kernel
async fn mesh() -> Mesh {
    let codec = Arc::new(WireCodec::new());
    let config = TransportConfig::default();
    let (local_end, remote_end) = connected_pair(&config, Arc::clone(&codec));
    let local_connector = Connector::new(local_end, Arc::clone(&codec), &config);
    let remote_connector = Connector::new(remote_end, codec, &config);

    let remote = Arc::new(CompositeKernel::new(".NET").unwrap());
    remote.add(language_kernel("csharp", "C#"), &["cs"]).unwrap();
    remote.add(language_kernel("fsharp", "F#"), &[]).unwrap();
    let remote_host = KernelHost::new(remote, remote_connector, uri("kernel://remote/")).unwrap();
    remote_host.connect().await.unwrap();

    let local = Arc::new(CompositeKernel::new(".NET").unwrap());
    local.add(language_kernel("javascript", "JavaScript"), &["js"]).unwrap();
    let local_host = KernelHost::new(Arc::clone(&local), local_connector, uri("kernel://local/")).unwrap();
    let proxy = tokio::time::timeout(
        Duration::from_secs(5),
        local_host.connect_proxy_kernel("csharp-proxy", uri("kernel://remote/csharp"), &[]),
    )
    .await
    .unwrap()
    .unwrap();

    Mesh {
        local,
        proxy,
        _local_host: local_host,
        _remote_host: remote_host,
    }
}

async fn send(kernel: &dyn Kernel, command: KernelCommand) -> KernelCommandResult {
    tokio::time::timeout(Duration::from_secs(5), kernel.send(command))
        .await
        .expect("command timed out")
        .unwrap()
}

fn return_values(result: &KernelCommandResult) -> Vec<String> {
    result
        .events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::ReturnValueProduced(value) => Some(value.formatted_values[0].value.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_command_slip_records_every_kernel_once() {
    let mesh = mesh().await;

    let result = send(
        mesh.local.as_ref(),
        KernelCommand::submit_code("1 + 1").with_target("csharp-proxy"),
    )
    .await;

    assert!(result.succeeded());
    assert_eq!(
        result.command.routing_slip.to_uri_array(),
        vec![
            uri("kernel://local/"),
            uri("kernel://local/csharp-proxy"),
            uri("kernel://remote/"),
            uri("kernel://remote/csharp"),
        ]
    );
}

#[tokio::test]
async fn test_remote_event_slip_runs_inside_out() {
    let mesh = mesh().await;

    let result = send(
        mesh.local.as_ref(),
        KernelCommand::submit_code("1 + 1").with_target("csharp-proxy"),
    )
    .await;

    let values: Vec<&KernelEvent> = result.events_of_type("ReturnValueProduced").collect();
    assert_eq!(values.len(), 1);
    assert_eq!(
        values[0].routing_slip.to_uri_array(),
        vec![
            uri("kernel://remote/csharp"),
            uri("kernel://remote/"),
            uri("kernel://local/csharp-proxy"),
            uri("kernel://local/"),
        ]
    );
}

#[tokio::test]
async fn test_subscribers_see_each_remote_event_once() {
    let mesh = mesh().await;
    let mut events = mesh.local.subscribe();

    let command = KernelCommand::submit_code("42").with_target("csharp-proxy");
    let id = command.id.clone();
    send(mesh.local.as_ref(), command).await;

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let done = event.is_terminal_for(&id);
        seen.push(event);
        if done {
            break;
        }
    }
    let values = seen
        .iter()
        .filter(|event| event.event_type() == "ReturnValueProduced" && event.command_id() == Some(&id))
        .count();
    assert_eq!(values, 1);
}

#[tokio::test]
async fn test_remote_failure_fails_local_command() {
    let mesh = mesh().await;

    let result = send(
        mesh.local.as_ref(),
        KernelCommand::submit_code("throw").with_target("csharp-proxy"),
    )
    .await;

    assert!(!result.succeeded());
    assert_eq!(result.failure_message(), Some("Unhandled exception"));
}

#[tokio::test]
async fn test_single_remote_submission_is_not_split() {
    let mesh = mesh().await;

    let command = KernelCommand::submit_code("#!csharp-proxy\n7").with_target("csharp-proxy");
    let id = command.id.clone();
    let result = send(mesh.local.as_ref(), command).await;

    assert_eq!(return_values(&result), vec!["7"]);
    let value = result.events_of_type("ReturnValueProduced").next().unwrap();
    assert_eq!(value.command_id(), Some(&id));
}

#[tokio::test]
async fn test_mixed_submission_spans_local_and_remote_kernels() {
    let mesh = mesh().await;

    let result = send(
        mesh.local.as_ref(),
        KernelCommand::submit_code("#!js\nconsole.log(1)\n#!csharp-proxy\n1 + 1"),
    )
    .await;

    assert!(result.succeeded());
    assert_eq!(return_values(&result), vec!["console.log(1)", "1 + 1"]);
}

#[tokio::test]
async fn test_proxy_info_is_refreshed_from_remote() {
    let mesh = mesh().await;

    let info = mesh.proxy.kernel_info();
    assert!(info.is_proxy);
    assert_eq!(info.uri, uri("kernel://local/csharp-proxy"));
    assert_eq!(info.remote_uri, Some(uri("kernel://remote/csharp")));
    assert_eq!(info.language_name.as_deref(), Some("C#"));
    assert!(info.supports(SubmitCode::TYPE));
}

#[tokio::test]
async fn test_composite_kernel_info_includes_proxy() {
    let mesh = mesh().await;

    let result = send(mesh.local.as_ref(), KernelCommand::request_kernel_info()).await;

    assert!(result.succeeded());
    let infos: Vec<_> = result
        .events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::KernelInfoProduced(produced) => Some(produced.kernel_info.clone()),
            _ => None,
        })
        .collect();
    let names: Vec<&str> = infos.iter().map(|info| info.local_name.as_str()).collect();
    assert_eq!(names, vec![".NET", "javascript", "csharp-proxy"]);
    assert_eq!(infos[2].language_name.as_deref(), Some("C#"));
}
