use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{CommandOutput, Transport};
use crate::{
    models::{ConnectTarget, DeviceRecord, ProgressAmount, TransferProgress, TransportBackend},
    task::ProgressSender,
};

/// Transport answering shell commands from a script, recording every call
#[derive(Debug)]
pub(crate) struct ScriptedTransport {
    responses: Mutex<HashMap<String, CommandOutput>>,
    devices: Mutex<Vec<DeviceRecord>>,
    calls: Mutex<Vec<String>>,
    gate: Arc<Semaphore>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            devices: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }
    }

    /// Transport whose commands block until [`release`](Self::release)
    pub fn gated() -> Self {
        Self { gate: Arc::new(Semaphore::new(0)), ..Self::new() }
    }

    pub fn release(&self) {
        self.gate.add_permits(1024);
    }

    pub fn script(&self, command: &str, output: CommandOutput) {
        self.responses.lock().unwrap().insert(command.to_string(), output);
    }

    pub fn script_ok(&self, command: &str, stdout: &str) {
        self.script(command, CommandOutput { exit_code: 0, stdout: stdout.into(), ..Default::default() });
    }

    pub fn add_device(&self, serial: &str, state: &str, model: Option<&str>) {
        let mut record = DeviceRecord { serial: serial.into(), state: state.into(), ..Default::default() };
        if let Some(model) = model {
            record.properties.insert("model".into(), model.into());
        }
        self.devices.lock().unwrap().push(record);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn pass_gate(&self) -> Result<()> {
        self.gate.acquire().await?.forget();
        Ok(())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn backend(&self) -> TransportBackend {
        TransportBackend::Process
    }

    async fn version(&self) -> Result<String> {
        Ok("Android Debug Bridge version 1.0.41".into())
    }

    async fn start_server(&self) -> Result<()> {
        self.record("start-server".into());
        Ok(())
    }

    async fn kill_server(&self) -> Result<()> {
        self.record("kill-server".into());
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>> {
        self.record("devices -l".into());
        self.pass_gate().await?;
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<String> {
        self.record(format!("connect {target}"));
        Ok(target.serial())
    }

    async fn disconnect(&self, serial: &str) -> Result<String> {
        self.record(format!("disconnect {serial}"));
        Ok(format!("disconnected {serial}"))
    }

    async fn execute(&self, serial: &str, argv: &[String]) -> Result<CommandOutput> {
        let command = argv.join(" ");
        self.record(format!("{serial}: {command}"));
        self.pass_gate().await?;
        self.responses
            .lock()
            .unwrap()
            .get(&command)
            .cloned()
            .ok_or_else(|| anyhow!("connection reset while running `{command}`"))
    }

    async fn pull(
        &self,
        serial: &str,
        remote: &str,
        local_dir: &Path,
        progress: &ProgressSender,
    ) -> Result<String> {
        self.record(format!("{serial}: pull {remote} {}", local_dir.display()));
        self.pass_gate().await?;
        progress.send(TransferProgress { label: remote.into(), amount: ProgressAmount::Percent(50) });
        progress.send(TransferProgress { label: remote.into(), amount: ProgressAmount::Percent(100) });
        Ok(format!("{remote}: 1 file pulled"))
    }

    async fn push(
        &self,
        serial: &str,
        local: &Path,
        remote_dir: &str,
        progress: &ProgressSender,
    ) -> Result<String> {
        self.record(format!("{serial}: push {} {remote_dir}", local.display()));
        self.pass_gate().await?;
        progress.send(TransferProgress {
            label: local.display().to_string(),
            amount: ProgressAmount::Bytes { done: 4, total: 4 },
        });
        Ok(format!("{}: 1 file pushed", local.display()))
    }
}
