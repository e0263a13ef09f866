//! Demo kernels wired into the CLI's composite

use std::sync::Arc;

use anyhow::{bail, Result};
use kernelmesh_core::contract::{FormattedValue, KernelEvent, KernelUri, SubmitCode};
use kernelmesh_core::kernel::{CompositeKernel, Kernel, KernelHost, LocalKernel};
use kernelmesh_core::transport::{connected_pair, Connector};
use kernelmesh_core::{MeshConfig, WireCodec};

/// Names of the demo kernels, in the order they are added
pub const DEMO_KERNELS: &[&str] = &["echo", "upper", "sum"];

const REMOTE_HOST_URI: &str = "kernel://remote/";

/// Returns the submitted code
fn echo() -> Result<LocalKernel> {
    let kernel = LocalKernel::new("echo")?
        .with_language("Echo", env!("CARGO_PKG_VERSION"))
        .with_aliases(&["e"]);
    kernel.register_handler(SubmitCode::TYPE, |command, context| async move {
        let code = command.code().unwrap_or_default().to_string();
        context.publish(KernelEvent::return_value(&command, FormattedValue::plain_text(code)));
        Ok(())
    });
    Ok(kernel)
}

/// Writes the submitted code upper-cased to standard output
fn upper() -> Result<LocalKernel> {
    let kernel = LocalKernel::new("upper")?.with_language("Upper", env!("CARGO_PKG_VERSION"));
    kernel.register_handler(SubmitCode::TYPE, |command, context| async move {
        let text = command.code().unwrap_or_default().to_uppercase();
        context.publish(KernelEvent::standard_output(&command, text));
        Ok(())
    });
    Ok(kernel)
}

/// Adds up whitespace or `+` separated integers
fn sum() -> Result<LocalKernel> {
    let kernel = LocalKernel::new("sum")?.with_language("Sum", env!("CARGO_PKG_VERSION"));
    kernel.register_handler(SubmitCode::TYPE, |command, context| async move {
        let total = evaluate_sum(command.code().unwrap_or_default())?;
        context.publish(KernelEvent::return_value(
            &command,
            FormattedValue::plain_text(total.to_string()),
        ));
        Ok(())
    });
    Ok(kernel)
}

fn evaluate_sum(code: &str) -> Result<i64> {
    let mut total: i64 = 0;
    for term in code.split(|c: char| c == '+' || c.is_whitespace()) {
        if term.is_empty() {
            continue;
        }
        let Ok(value) = term.parse::<i64>() else {
            bail!("cannot evaluate '{}'", term);
        };
        total = total.saturating_add(value);
    }
    Ok(total)
}

/// Composite named by the config with every demo kernel as a child
pub fn demo_composite(config: &MeshConfig) -> Result<Arc<CompositeKernel>> {
    let composite = CompositeKernel::from_config(&config.kernel)?;
    composite.add(Arc::new(echo()?), &[])?;
    composite.add(Arc::new(upper()?), &[])?;
    composite.add(Arc::new(sum()?), &[])?;
    Ok(Arc::new(composite))
}

/// The demo kernels behind an in-process host, reached through proxies
///
/// Returned hosts must stay alive for as long as the composite is used.
pub async fn remote_demo_composite(config: &MeshConfig) -> Result<(Arc<CompositeKernel>, Vec<KernelHost>)> {
    let codec = Arc::new(WireCodec::new());
    let (local_end, remote_end) = connected_pair(&config.transport, Arc::clone(&codec));
    let local_connector = Connector::new(local_end, Arc::clone(&codec), &config.transport);
    let remote_connector = Connector::new(remote_end, codec, &config.transport);

    let remote_config = MeshConfig::default();
    let remote = demo_composite(&remote_config)?;
    let remote_host_uri = KernelUri::parse(REMOTE_HOST_URI)?;
    let remote_host = KernelHost::new(remote, remote_connector, remote_host_uri.clone())?;
    remote_host.connect().await?;

    let local = Arc::new(CompositeKernel::from_config(&config.kernel)?);
    let local_host_uri = match config.host_uri()? {
        Some(uri) => uri,
        None => KernelUri::parse("kernel://local/")?,
    };
    let local_host = KernelHost::new(Arc::clone(&local), local_connector, local_host_uri)?;
    for name in DEMO_KERNELS {
        let proxy = local_host
            .connect_proxy_kernel(name, remote_host_uri.join(name)?, &[])
            .await?;
        tracing::debug!(proxy = %proxy.name(), remote = ?proxy.remote_uri(), "proxy connected");
    }

    Ok((local, vec![local_host, remote_host]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelmesh_core::KernelCommand;

    #[test]
    fn test_evaluate_sum() {
        assert_eq!(evaluate_sum("1 + 2 +3").unwrap(), 6);
        assert_eq!(evaluate_sum("").unwrap(), 0);
        assert_eq!(
            evaluate_sum("1 + x").unwrap_err().to_string(),
            "cannot evaluate 'x'"
        );
    }

    #[tokio::test]
    async fn test_demo_composite_routes_by_alias() {
        let composite = demo_composite(&MeshConfig::default()).unwrap();
        let result = composite
            .send(KernelCommand::submit_code("hi").with_target("e"))
            .await
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.events_of_type("ReturnValueProduced").count(), 1);
    }

    #[tokio::test]
    async fn test_remote_demo_composite_reaches_remote_kernels() {
        let (composite, _hosts) = remote_demo_composite(&MeshConfig::default()).await.unwrap();
        let result = composite
            .send(KernelCommand::submit_code("2 + 3").with_target("sum"))
            .await
            .unwrap();
        assert!(result.succeeded());
        let value = result.events_of_type("ReturnValueProduced").next().unwrap();
        assert_eq!(
            value.routing_slip.to_uri_array().first(),
            Some(&KernelUri::parse("kernel://remote/sum").unwrap())
        );
    }
}
