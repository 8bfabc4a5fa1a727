//! Liveness and readiness probes

use crate::aci;
use crate::error::{ProviderError, Result};
use k8s_openapi::api::core::v1::{ContainerPort, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Translate a probe; exactly one of exec or httpGet must be set
pub fn translate_probe(probe: &Probe, ports: &[ContainerPort]) -> Result<aci::ContainerProbe> {
    let (exec, http_get) = match (&probe.exec, &probe.http_get) {
        (Some(_), Some(_)) => {
            return Err(ProviderError::validation(
                "probe may not specify more than one of exec and httpGet",
            ))
        }
        (None, None) => {
            return Err(ProviderError::validation(
                "probe must specify one of exec and httpGet",
            ))
        }
        (Some(exec), None) => (
            Some(aci::ContainerExec {
                command: exec.command.clone().unwrap_or_default(),
            }),
            None,
        ),
        (None, Some(http)) => {
            let port = resolve_port(&http.port, ports)?;
            (
                None,
                Some(aci::ContainerHttpGet {
                    path: http.path.clone(),
                    port,
                    scheme: http.scheme.clone(),
                }),
            )
        }
    };

    Ok(aci::ContainerProbe {
        exec,
        http_get,
        initial_delay_seconds: probe.initial_delay_seconds,
        period_seconds: probe.period_seconds,
        failure_threshold: probe.failure_threshold,
        success_threshold: probe.success_threshold,
        timeout_seconds: probe.timeout_seconds,
    })
}

fn resolve_port(port: &IntOrString, ports: &[ContainerPort]) -> Result<i32> {
    match port {
        IntOrString::Int(number) => Ok(*number),
        IntOrString::String(name) => ports
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .map(|p| p.container_port)
            .ok_or_else(|| {
                ProviderError::validation(format!(
                    "unable to find named port {name:?} among the container ports"
                ))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ExecAction, HTTPGetAction, TCPSocketAction};

    fn named_port(name: &str, port: i32) -> ContainerPort {
        ContainerPort {
            name: Some(name.to_string()),
            container_port: port,
            ..Default::default()
        }
    }

    fn http_probe(port: IntOrString) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port,
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(5),
            failure_threshold: Some(3),
            success_threshold: Some(1),
            timeout_seconds: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_exec_probe() {
        let probe = Probe {
            exec: Some(ExecAction {
                command: Some(vec!["cat".to_string(), "/tmp/ready".to_string()]),
            }),
            ..Default::default()
        };

        let translated = translate_probe(&probe, &[]).unwrap();
        assert_eq!(translated.exec.unwrap().command, vec!["cat", "/tmp/ready"]);
        assert!(translated.http_get.is_none());
    }

    #[test]
    fn test_http_probe_carries_timing() {
        let translated = translate_probe(&http_probe(IntOrString::Int(8080)), &[]).unwrap();
        let http = translated.http_get.as_ref().unwrap();
        assert_eq!(http.port, 8080);
        assert_eq!(http.path.as_deref(), Some("/healthz"));
        assert_eq!(translated.initial_delay_seconds, Some(10));
        assert_eq!(translated.period_seconds, Some(5));
        assert_eq!(translated.failure_threshold, Some(3));
        assert_eq!(translated.success_threshold, Some(1));
        assert_eq!(translated.timeout_seconds, Some(2));
    }

    #[test]
    fn test_named_port_resolves() {
        let ports = vec![named_port("metrics", 9090), named_port("http", 8080)];
        let probe = http_probe(IntOrString::String("http".to_string()));

        let translated = translate_probe(&probe, &ports).unwrap();
        assert_eq!(translated.http_get.unwrap().port, 8080);
    }

    #[test]
    fn test_unknown_named_port_fails() {
        let ports = vec![named_port("http", 8080)];
        let probe = http_probe(IntOrString::String("admin".to_string()));

        let err = translate_probe(&probe, &ports).unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[test]
    fn test_probe_requires_exactly_one_handler() {
        let mut both = http_probe(IntOrString::Int(80));
        both.exec = Some(ExecAction {
            command: Some(vec!["true".to_string()]),
        });
        assert!(translate_probe(&both, &[]).is_err());

        let tcp_only = Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(80),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(translate_probe(&tcp_only, &[]).is_err());
    }
}
