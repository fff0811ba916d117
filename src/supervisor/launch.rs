//! Broker launch preparation
//!
//! Everything the broker needs before its first start: the rendered
//! server.properties, the unpacked distribution and the process environment.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::process::Command;

use crate::config::{ClusterConfig, LaunchConfig};
use crate::error::{Error, Result};
use crate::tuning::{HeapOptions, JVM_PERFORMANCE_OPTS};

/// Runtime values a broker launch is built from
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Broker id won in the election
    pub broker_id: u32,
    /// Heap layout
    pub heap: HeapOptions,
    /// Ports from the command line; index 1 is the JMX port
    pub ports: Vec<u16>,
    /// Cluster the broker joins
    pub cluster: ClusterConfig,
    /// This host's name
    pub hostname: String,
}

impl LaunchPlan {
    /// JMX management port
    pub fn jmx_port(&self) -> Result<u16> {
        self.ports
            .get(1)
            .copied()
            .ok_or_else(|| Error::Config("no JMX port: expected at least 2 ports".into()))
    }

    /// Environment handed to the broker process
    pub fn environment(&self, launch: &LaunchConfig) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        env.insert("KAFKA_HEAP_OPTS".to_string(), self.heap.kafka_heap_opts());
        env.insert("SCALA_VERSION".to_string(), launch.scala_version.clone());
        env.insert(
            "KAFKA_LOG4J_OPTS".to_string(),
            format!("-Dlog4j.configuration=file:{}", launch.log4j_config),
        );
        env.insert(
            "KAFKA_JVM_PERFORMANCE_OPTS".to_string(),
            JVM_PERFORMANCE_OPTS.to_string(),
        );
        env.insert("JMX_PORT".to_string(), self.jmx_port()?.to_string());
        Ok(env)
    }

    /// Variables visible to the server.properties template
    pub fn template_globals(&self) -> Result<liquid::Object> {
        let mut globals = liquid::Object::new();
        globals.insert("broker_id".into(), liquid::model::to_value(&self.broker_id)?);
        globals.insert("heap_size".into(), liquid::model::to_value(&self.heap.max_mb)?);
        globals.insert("ports".into(), liquid::model::to_value(&self.ports)?);
        globals.insert("port".into(), liquid::model::to_value(&self.ports.first())?);
        globals.insert("jmx_port".into(), liquid::model::to_value(&self.jmx_port()?)?);
        globals.insert(
            "zk_connect".into(),
            liquid::model::to_value(&self.cluster.zk_connect())?,
        );
        globals.insert("cluster".into(), liquid::model::to_value(&self.cluster.name)?);
        globals.insert("hostname".into(), liquid::model::to_value(&self.hostname)?);
        Ok(globals)
    }

    /// Render `source` with this plan's values
    pub fn render(&self, source: &str) -> Result<String> {
        let parser = liquid::ParserBuilder::with_stdlib().build()?;
        let template = parser.parse(source)?;
        Ok(template.render(&self.template_globals()?)?)
    }

    /// Render the template file at `template` into `output`
    pub fn write_properties(&self, template: &Path, output: &Path) -> Result<()> {
        let source = std::fs::read_to_string(template).map_err(|e| {
            Error::Config(format!("cannot read template {}: {}", template.display(), e))
        })?;
        let rendered = self.render(&source)?;
        std::fs::write(output, rendered)?;
        tracing::info!(
            template = %template.display(),
            output = %output.display(),
            broker_id = self.broker_id,
            "Rendered broker configuration"
        );
        Ok(())
    }
}

/// Unpack the distribution archive into the working directory
pub async fn unpack_archive(archive: &Path) -> Result<()> {
    tracing::info!(archive = %archive.display(), "Unpacking broker distribution");
    let status = Command::new("tar").arg("xf").arg(archive).status().await?;
    if !status.success() {
        return Err(Error::Launch(format!(
            "tar xf {} failed: {}",
            archive.display(),
            status
        )));
    }
    Ok(())
}

/// Shell command plus environment for one broker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Command line, run through `sh -c`
    pub command: String,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    /// Create a worker command
    pub fn new(command: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        Self {
            command: command.into(),
            env,
        }
    }

    /// Build the process; the child dies with its handle
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command).envs(&self.env).kill_on_drop(true);
        cmd
    }
}
