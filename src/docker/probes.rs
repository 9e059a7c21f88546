//! Health-probe extraction from container metadata.
//!
//! Kubernetes stores the pod spec as stringified JSON in a well-known
//! container label; a probe declared there wins over the runtime's own
//! `Healthcheck` so that a container is never attributed both. Only
//! exec-style probes are extracted; the core never runs them.

use std::collections::HashMap;

use serde_json::Value;

use crate::container::{ContainerInfo, HealthProbe, ProbeKind};

/// Label under which the Kubernetes node agent stores the applied pod spec.
const POD_SPEC_LABEL: &str = "annotation.kubectl.kubernetes.io/last-applied-configuration";

/// Strips matched pairs of surrounding `"` or `'` quotes, repeatedly, until
/// the outermost characters no longer match. A lone leading quote is kept.
pub fn normalize_arg(arg: &str) -> String {
    let mut arg = arg;
    while arg.len() >= 2 {
        let bytes = arg.as_bytes();
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            arg = &arg[1..arg.len() - 1];
        } else {
            break;
        }
    }
    arg.to_owned()
}

/// Extracts health probes from the container's labels and `Healthcheck`.
///
/// A liveness or readiness probe found in the pod-spec label suppresses the
/// runtime healthcheck entirely; the liveness probe in turn suppresses the
/// readiness probe. Only the first entry of `spec.containers` is examined,
/// so multi-container and init-container pods are attributed to their first
/// container.
pub fn parse_health_probes(
    labels: &HashMap<String, String>,
    healthcheck: Option<&Value>,
    container: &mut ContainerInfo,
) {
    let mut liveness_readiness_added = false;

    if let Some(spec) = pod_spec(labels) {
        if let Some(probe) = spec.get("livenessProbe") {
            liveness_readiness_added =
                parse_exec_probe(probe, ProbeKind::LivenessProbe, container);
        } else if let Some(probe) = spec.get("readinessProbe") {
            liveness_readiness_added =
                parse_exec_probe(probe, ProbeKind::ReadinessProbe, container);
        }
    }

    if !liveness_readiness_added {
        if let Some(healthcheck) = healthcheck {
            parse_healthcheck(healthcheck, container);
        }
    }
}

/// Returns the first container entry of the pod spec stored in the labels,
/// if present and well-formed.
fn pod_spec(labels: &HashMap<String, String>) -> Option<Value> {
    let raw = labels.get(POD_SPEC_LABEL)?;
    if raw.is_empty() {
        return None;
    }

    let config: Value = match serde_json::from_str(raw) {
        Ok(config) => config,
        Err(err) => {
            log::warn!("could not parse pod config from container label: {err}");
            return None;
        }
    };

    config
        .get("spec")?
        .get("containers")?
        .as_array()?
        .first()
        .cloned()
}

/// Emits a probe from a pod-spec `exec.command` declaration.
///
/// Returns `true` when the declaration was present (even if the command
/// turned out not to be an array), matching the suppression rule above.
fn parse_exec_probe(probe: &Value, kind: ProbeKind, container: &mut ContainerInfo) -> bool {
    let Some(command) = probe.get("exec").and_then(|exec| exec.get("command")) else {
        log::warn!("could not parse {kind} probe: no exec command");
        return false;
    };

    if let Some(items) = command.as_array() {
        let mut items = items.iter().map(|item| item.as_str().unwrap_or_default());
        let exe = normalize_arg(items.next().unwrap_or_default());
        let args = items.map(normalize_arg).collect();

        log::debug!("setting {kind} probe exe={exe}");
        container.health_probes.push(HealthProbe { kind, exe, args });
    }

    true
}

/// Emits a healthcheck probe from the runtime's `Healthcheck` object.
fn parse_healthcheck(healthcheck: &Value, container: &mut ContainerInfo) {
    let Some(test) = healthcheck.get("Test") else {
        log::warn!("could not parse health check: no Test property");
        return;
    };
    let Some(test) = test.as_array() else {
        log::warn!("could not parse health check: Test property is not an array");
        return;
    };

    if test.len() == 1 {
        if test[0].as_str() != Some("NONE") {
            log::warn!("could not parse health check: expected NONE for single-element Test");
        }
        return;
    }

    match test.first().and_then(Value::as_str) {
        Some("CMD") => {
            let exe = normalize_arg(test.get(1).and_then(Value::as_str).unwrap_or_default());
            let args = test[2..]
                .iter()
                .map(|item| normalize_arg(item.as_str().unwrap_or_default()))
                .collect();

            log::debug!("setting healthcheck exe={exe}");
            container.health_probes.push(HealthProbe {
                kind: ProbeKind::Healthcheck,
                exe,
                args,
            });
        }
        Some("CMD-SHELL") => {
            // the script is passed to the shell verbatim
            let script = test.get(1).and_then(Value::as_str).unwrap_or_default();

            log::debug!("setting healthcheck exe=/bin/sh");
            container.health_probes.push(HealthProbe {
                kind: ProbeKind::Healthcheck,
                exe: "/bin/sh".to_owned(),
                args: vec!["-c".to_owned(), script.to_owned()],
            });
        }
        _ => {
            log::warn!("could not parse health check: expected CMD or CMD-SHELL");
        }
    }
}
