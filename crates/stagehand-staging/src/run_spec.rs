//! Container run configuration derived from an image and its declared resources.

use std::collections::BTreeMap;
use std::path::Path;

use stagehand_core::{ResourceData, RestartPolicy, units};

use crate::engine::ImageDetails;
use crate::error::StagingError;

/// In-container path the data directory is mounted at.
pub const PERSISTENT_DIR: &str = "/var/vcap/data";

const NANOS_PER_CPU: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub nano_cpus: i64,
    /// Memory limit in bytes
    pub memory: i64,
}

/// How a container is wired to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    /// `port/proto` to fixed host port; `None` lets the engine choose
    pub port_bindings: BTreeMap<String, Option<u16>>,
    /// `host:container` bind mounts
    pub binds: Vec<String>,
    /// Omitted entirely when either resource string is malformed
    pub limits: Option<ResourceLimits>,
    pub restart_policy: RestartPolicy,
    /// `KEY=VALUE` pairs, caller-supplied first
    pub env: Vec<String>,
}

/// Inputs to [`RunSpec::derive`] that come from configuration and the caller.
#[derive(Debug, Clone, Copy)]
pub struct RunInputs<'a> {
    pub dynamic_ports: bool,
    pub restart_policy: RestartPolicy,
    pub data_dir: Option<&'a Path>,
    pub caller_env: &'a BTreeMap<String, String>,
    pub fixed_env: &'a [(&'static str, String)],
}

impl RunSpec {
    /// Derive the run configuration.
    ///
    /// Returns the spec plus warnings for resource strings that could not be parsed.
    pub fn derive(
        image: &ImageDetails,
        resources: &ResourceData,
        inputs: RunInputs<'_>,
    ) -> Result<(Self, Vec<String>), StagingError> {
        let mut port_bindings = BTreeMap::new();
        for exposed in &image.exposed_ports {
            let (port, proto) = parse_exposed_port(exposed)?;
            let host = (!inputs.dynamic_ports).then_some(port);
            port_bindings.insert(format!("{port}/{proto}"), host);
        }

        let binds = match inputs.data_dir {
            Some(dir) if !dir.as_os_str().is_empty() => {
                vec![format!("{}:{PERSISTENT_DIR}", dir.display())]
            }
            _ => Vec::new(),
        };

        let (limits, warnings) = match resource_limits(resources) {
            Ok(limits) => (Some(limits), Vec::new()),
            Err(warning) => (None, vec![warning]),
        };

        let env = inputs
            .caller_env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(inputs.fixed_env.iter().map(|(k, v)| format!("{k}={v}")))
            .collect();

        Ok((
            Self {
                port_bindings,
                binds,
                limits,
                restart_policy: inputs.restart_policy,
                env,
            },
            warnings,
        ))
    }
}

fn parse_exposed_port(exposed: &str) -> Result<(u16, &str), StagingError> {
    let (port, proto) = exposed.split_once('/').unwrap_or((exposed, "tcp"));
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| StagingError::InvalidExposedPort {
            port: exposed.to_owned(),
        })?;
    let proto = if proto.is_empty() { "tcp" } else { proto };
    Ok((port, proto))
}

fn resource_limits(resources: &ResourceData) -> Result<ResourceLimits, String> {
    let cores = units::parse_cpu(&resources.cpu).map_err(|e| e.to_string())?;
    let memory = units::parse_size(&resources.memory).map_err(|e| e.to_string())?;
    Ok(ResourceLimits {
        nano_cpus: (cores * NANOS_PER_CPU) as i64,
        memory: i64::try_from(memory).unwrap_or(i64::MAX),
    })
}
