use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use futures::FutureExt;
use tracing::{debug, info, instrument, trace};

use crate::{
    adb::{Transport, create_transport},
    error::{ExplorerError, precondition},
    models::{Device, FileEntry, Settings, TransferProgress},
    registry::DeviceRegistry,
    repository::FileRepository,
    task::{Job, TaskCoordinator, TaskEvent, TaskId, TaskOutput, Ticket},
};

/// Message for the user at the end of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub is_error: bool,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Task events as delivered to the presentation layer
#[derive(Debug)]
pub enum SessionEvent {
    Started { id: TaskId },
    Progress { id: TaskId, progress: TransferProgress },
    Completed { id: TaskId, output: TaskOutput },
    Failed { id: TaskId, error: anyhow::Error },
}

impl SessionEvent {
    pub fn id(&self) -> &TaskId {
        match self {
            Self::Started { id }
            | Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. } => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Toast for terminal events, `None` for the rest
    pub fn notification(&self) -> Option<Notification> {
        let message = match self {
            Self::Started { .. } | Self::Progress { .. } => return None,
            Self::Failed { id, error } => {
                return Some(Notification {
                    message: format!("Failed to {id}: {error:#}"),
                    is_error: true,
                });
            }
            Self::Completed { output, .. } => match output {
                TaskOutput::Devices(devices) => match devices.len() {
                    1 => "Found 1 device".to_string(),
                    n => format!("Found {n} devices"),
                },
                TaskOutput::Connected(device) => format!("Connected to {}", device.display_name),
                TaskOutput::Disconnected(serial) => format!("Disconnected from {serial}"),
                TaskOutput::Listing(listing) => {
                    let mut message =
                        format!("{} items in {}", listing.entries.len(), listing.directory);
                    if let Some(diagnostics) = &listing.diagnostics {
                        message.push('\n');
                        message.push_str(diagnostics);
                    }
                    message
                }
                TaskOutput::Entry(entry) => entry.path.clone(),
                TaskOutput::Done(message) => message.clone(),
                TaskOutput::Text(text) => format!("Read {} bytes", text.len()),
            },
        };
        Some(Notification { message, is_error: false })
    }
}

/// Everything one user session needs: the transport, known devices, the active
/// device's navigation and the tasks in flight.
///
/// Only `&mut Session` changes the active device or the navigation path, so task
/// results are applied here when they are delivered.
#[derive(Debug)]
pub struct Session {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    registry: DeviceRegistry,
    repository: FileRepository,
    coordinator: TaskCoordinator,
}

impl Session {
    /// Session on the transport the settings select
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        let transport = create_transport(&settings)?;
        Ok(Self::with_transport(settings, transport))
    }

    pub fn with_transport(settings: Arc<Settings>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry: DeviceRegistry::new(transport.clone()),
            repository: FileRepository::new(transport.clone(), settings.clone()),
            coordinator: TaskCoordinator::new(),
            settings,
            transport,
        }
    }

    /// Makes sure the adb server is up. Returns the adb version.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn start(&self) -> Result<String> {
        self.transport.start_server().await?;
        let version = self.transport.version().await?;
        info!(%version, backend = ?self.transport.backend(), "ADB ready");
        Ok(version)
    }

    #[instrument(level = "debug", skip(self), err)]
    pub async fn shutdown(&self) -> Result<()> {
        if self.settings.kill_server_at_exit {
            info!("Killing ADB server");
            self.transport.kill_server().await?;
        }
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn devices(&self) -> &[Device] {
        self.registry.devices()
    }

    pub fn active_device(&self) -> Option<&Device> {
        self.registry.active()
    }

    /// Browses `id` from the root
    pub fn select_device(&mut self, id: &str) -> Result<()> {
        let device = self
            .registry
            .find(id)
            .cloned()
            .ok_or_else(|| precondition(format!("Unknown device '{id}'")))?;
        if !device.is_available() {
            return Err(ExplorerError::DeviceUnavailable(format!(
                "{} is {}",
                device.display_name, device.state
            ))
            .into());
        }
        debug!(id, "Selecting device");
        self.registry.set_active(device.clone());
        self.repository.set_device(Some(device));
        Ok(())
    }

    pub fn clear_device(&mut self) {
        self.registry.clear_active();
        self.repository.set_device(None);
    }

    pub fn current_path(&self) -> String {
        self.repository.current_path()
    }

    pub fn descend_into(&mut self, entry: &FileEntry) -> bool {
        self.repository.descend_into(entry)
    }

    pub fn ascend(&mut self) -> bool {
        self.repository.ascend()
    }

    pub fn jump_to(&mut self, entry: &FileEntry) -> bool {
        self.repository.jump_to(entry)
    }

    /// Jumps to a typed absolute path
    pub fn jump_to_path(&mut self, path: &str) -> bool {
        self.repository.jump_to(&FileEntry::directory_at(path))
    }

    fn active_id(&self) -> Option<String> {
        self.repository.active_device().map(|d| d.id.clone())
    }

    /// Reserves `id` and runs the job `build` produces. Nothing is launched if either fails.
    fn submit<T, F, B>(&mut self, id: TaskId, device_bound: bool, build: B, wrap: F) -> Result<TaskId>
    where
        T: Send + 'static,
        B: FnOnce(&Self, &Ticket) -> Result<Job<T>>,
        F: FnOnce(T) -> TaskOutput + Send + 'static,
    {
        let ticket = self.coordinator.reserve(id.clone())?;
        let job = build(self, &ticket)?;
        let device = if device_bound { self.active_id() } else { None };
        self.coordinator.launch(ticket, device, async move { job.await.map(wrap) }.boxed());
        Ok(id)
    }

    pub fn request_devices(&mut self) -> Result<TaskId> {
        self.submit(TaskId::Devices, false, |s, _| Ok(s.registry.discover_job()), TaskOutput::Devices)
    }

    pub fn connect(&mut self, target: &str) -> Result<TaskId> {
        self.submit(TaskId::Connect, false, |s, _| s.registry.connect_job(target), TaskOutput::Connected)
    }

    pub fn disconnect(&mut self, id: &str) -> Result<TaskId> {
        let device = self
            .registry
            .find(id)
            .or(self.registry.active().filter(|d| d.id == id))
            .cloned()
            .ok_or_else(|| precondition(format!("Unknown device '{id}'")))?;
        self.submit(
            TaskId::Disconnect,
            false,
            move |s, _| Ok(s.registry.disconnect_job(&device)),
            TaskOutput::Disconnected,
        )
    }

    pub fn list(&mut self) -> Result<TaskId> {
        self.submit(TaskId::List, true, |s, _| s.repository.list(), TaskOutput::Listing)
    }

    pub fn stat(&mut self, path: &str) -> Result<TaskId> {
        self.submit(TaskId::Stat, true, |s, _| s.repository.stat(path), TaskOutput::Entry)
    }

    pub fn rename(&mut self, entry: &FileEntry, new_name: &str) -> Result<TaskId> {
        self.submit(TaskId::Rename, true, |s, _| s.repository.rename(entry, new_name), TaskOutput::Done)
    }

    pub fn delete(&mut self, entry: &FileEntry) -> Result<TaskId> {
        self.submit(TaskId::Delete, true, |s, _| s.repository.remove(entry), TaskOutput::Done)
    }

    pub fn create_directory(&mut self, name: &str) -> Result<TaskId> {
        self.submit(TaskId::CreateDirectory, true, |s, _| s.repository.mkdir(name), TaskOutput::Done)
    }

    pub fn upload(&mut self, local: &Path) -> Result<TaskId> {
        self.submit(
            TaskId::Upload,
            true,
            |s, ticket| s.repository.upload(local, ticket.progress()),
            TaskOutput::Done,
        )
    }

    /// Downloads `entry` into `destination`, or the device's download folder
    pub fn download(&mut self, entry: &FileEntry, destination: Option<PathBuf>) -> Result<TaskId> {
        self.submit(
            TaskId::Download(entry.path.clone()),
            true,
            move |s, ticket| s.repository.download(entry, destination, ticket.progress()),
            TaskOutput::Done,
        )
    }

    pub fn read_file(&mut self, entry: &FileEntry) -> Result<TaskId> {
        self.submit(TaskId::ReadFile, true, |s, _| s.repository.read_file(entry), TaskOutput::Text)
    }

    /// Abandons interest in `id`. Its transport call still runs to completion.
    pub fn cancel(&mut self, id: &TaskId) -> bool {
        self.coordinator.cancel(id)
    }

    pub fn is_busy(&self, id: &TaskId) -> bool {
        self.coordinator.is_busy(id)
    }

    /// Waits for the next event relevant to the current device
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let event = self.coordinator.next_event().await?;
            if let Some(event) = self.deliver(event) {
                return Some(event);
            }
        }
    }

    /// Like [`next_event`](Self::next_event) without waiting
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        while let Some(event) = self.coordinator.try_next_event() {
            if let Some(event) = self.deliver(event) {
                return Some(event);
            }
        }
        None
    }

    /// Drops events of tasks bound to a device that is no longer active and applies
    /// registry-changing results
    fn deliver(&mut self, event: TaskEvent) -> Option<SessionEvent> {
        if let Some(device) = event.device()
            && self.active_id().as_deref() != Some(device)
        {
            trace!(id = %event.id(), device, "Dropping event of inactive device");
            return None;
        }

        Some(match event {
            TaskEvent::Started { id, .. } => SessionEvent::Started { id },
            TaskEvent::Progress { id, progress, .. } => SessionEvent::Progress { id, progress },
            TaskEvent::Finished { id, result: Err(error), .. } => SessionEvent::Failed { id, error },
            TaskEvent::Finished { id, result: Ok(output), .. } => {
                self.apply(&output);
                SessionEvent::Completed { id, output }
            }
        })
    }

    fn apply(&mut self, output: &TaskOutput) {
        match output {
            TaskOutput::Devices(devices) => {
                self.registry.remember(devices.clone());
                if let Some(active) = self.registry.active().cloned() {
                    self.repository.update_device(active);
                }
            }
            TaskOutput::Connected(device) => self.registry.upsert(device.clone()),
            TaskOutput::Disconnected(serial) => {
                if self.active_id().as_deref() == Some(serial) {
                    self.repository.set_device(None);
                }
                self.registry.forget(serial);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        adb::testing::ScriptedTransport,
        error::ErrorKind,
        models::{DeviceState, FileKind},
    };

    const SERIAL: &str = "emulator-5554";

    fn session(transport: Arc<ScriptedTransport>) -> Session {
        Session::with_transport(Arc::new(Settings::default()), transport)
    }

    fn ready(id: &str) -> Device {
        Device { id: id.into(), display_name: "Pixel 7".into(), state: DeviceState::Ready }
    }

    /// Events until the terminal one of `id`
    async fn until_done(session: &mut Session, id: &TaskId) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
                .await
                .expect("timed out waiting for task")
                .expect("channel closed");
            let done = event.id() == id && event.is_terminal();
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn browse_sdcard() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.add_device(SERIAL, "device", Some("Pixel_7"));
        transport.script_ok(
            "ls -a -l '/'",
            "drwxrwx--x 4 root sdcard_rw 4096 2024-01-01 00:00 sdcard\n",
        );
        transport.script_ok(
            "ls -a -l '/sdcard/'",
            "drwxrwx--x 2 root sdcard_rw 4096 2024-01-01 00:00 Download\n\
             lrwxrwxrwx 1 root root 11 2024-01-01 00:00 cache -> /data/cache\n",
        );
        transport.script_ok("ls -a -d '/sdcard/'*/ '/sdcard/'.*/", "/sdcard/Download/\n/sdcard/cache/\n");
        let mut session = session(transport);

        let id = session.request_devices().unwrap();
        until_done(&mut session, &id).await;
        assert_eq!(session.devices().len(), 1);
        session.select_device(SERIAL).unwrap();

        let id = session.list().unwrap();
        let events = until_done(&mut session, &id).await;
        let Some(SessionEvent::Completed { output: TaskOutput::Listing(root), .. }) = events.last()
        else {
            panic!("unexpected events {events:?}");
        };
        assert!(session.descend_into(&root.entries[0]));
        assert_eq!(session.current_path(), "/sdcard");

        let id = session.list().unwrap();
        let events = until_done(&mut session, &id).await;
        let Some(SessionEvent::Completed { output: TaskOutput::Listing(listing), .. }) =
            events.last()
        else {
            panic!("unexpected events {events:?}");
        };
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Download", "cache"]);
        assert_eq!(listing.entries[1].link_target_kind, Some(FileKind::Directory));
        assert_eq!(events.last().unwrap().notification().unwrap().message, "2 items in /sdcard");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_list_is_rejected_while_first_runs() {
        let transport = Arc::new(ScriptedTransport::gated());
        transport.script_ok("ls -a -l '/'", "");
        let mut session = session(transport.clone());
        session.registry.remember(vec![ready(SERIAL)]);
        session.select_device(SERIAL).unwrap();

        let id = session.list().unwrap();
        let err = session.list().unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::TaskInFlight);

        transport.release();
        let events = until_done(&mut session, &id).await;
        assert!(matches!(events.last(), Some(SessionEvent::Completed { .. })));
        // The rejected request never reached the transport
        assert_eq!(transport.calls(), [format!("{SERIAL}: ls -a -l '/'")]);
        assert!(session.list().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn results_for_previous_device_are_dropped() {
        let transport = Arc::new(ScriptedTransport::gated());
        transport.script_ok("ls -a -l '/'", "");
        let mut session = session(transport.clone());
        session.registry.remember(vec![ready(SERIAL), ready("R58N")]);
        session.select_device(SERIAL).unwrap();
        session.list().unwrap();

        session.select_device("R58N").unwrap();
        transport.release();

        let mut seen = Vec::new();
        while session.is_busy(&TaskId::List) {
            match tokio::time::timeout(Duration::from_millis(200), session.next_event()).await {
                Ok(Some(event)) => seen.push(event),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        assert!(seen.is_empty(), "{seen:?}");
        assert_eq!(session.current_path(), "/");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn progress_precedes_result() {
        let transport = Arc::new(ScriptedTransport::new());
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            downloads_location: dir.path().to_string_lossy().to_string(),
            ..Settings::default()
        };
        let mut session = Session::with_transport(Arc::new(settings), transport);
        session.registry.remember(vec![ready(SERIAL)]);
        session.select_device(SERIAL).unwrap();

        let file = FileEntry {
            permissions: "-rw-rw----".into(),
            ..FileEntry::directory_at("/sdcard/a.bin")
        };
        let id = session.download(&file, None).unwrap();
        assert_eq!(id, TaskId::Download("/sdcard/a.bin".into()));
        let events = until_done(&mut session, &id).await;
        let percents: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Progress { progress, .. } => Some(progress.percent()),
                _ => None,
            })
            .collect();
        assert_eq!(percents, [50, 100]);
        assert!(matches!(events.last(), Some(SessionEvent::Completed { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_task_delivers_nothing() {
        let transport = Arc::new(ScriptedTransport::gated());
        let mut session = session(transport.clone());
        let id = session.request_devices().unwrap();
        assert!(session.cancel(&id));
        // Still occupies its identity until the worker finishes
        assert!(session.request_devices().is_err());

        transport.release();
        let mut seen = Vec::new();
        while session.is_busy(&id) {
            match tokio::time::timeout(Duration::from_millis(200), session.next_event()).await {
                Ok(Some(event)) => seen.push(event),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        assert!(seen.is_empty(), "{seen:?}");
        assert!(session.request_devices().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_become_error_notifications() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut session = session(transport);
        session.registry.remember(vec![ready(SERIAL)]);
        session.select_device(SERIAL).unwrap();

        // Nothing scripted, so the transport fails
        let id = session.create_directory("New").unwrap();
        let events = until_done(&mut session, &id).await;
        let notification = events.last().unwrap().notification().unwrap();
        assert!(notification.is_error);
        assert!(notification.message.starts_with("Failed to create folder"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disconnect_clears_active_device() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut session = session(transport.clone());
        session.registry.remember(vec![ready("10.0.0.7:5555")]);
        session.select_device("10.0.0.7:5555").unwrap();
        assert!(session.jump_to_path("/sdcard"));

        let id = session.disconnect("10.0.0.7:5555").unwrap();
        until_done(&mut session, &id).await;
        assert!(session.active_device().is_none());
        assert!(session.devices().is_empty());
        assert_eq!(session.current_path(), "/");
        assert_eq!(transport.calls(), ["disconnect 10.0.0.7:5555"]);
    }

    #[test]
    fn selecting_requires_known_ready_device() {
        let mut session = session(Arc::new(ScriptedTransport::new()));
        let err = session.select_device(SERIAL).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::PreconditionUnmet);

        session.registry.remember(vec![Device { state: DeviceState::Unauthorized, ..ready(SERIAL) }]);
        let err = session.select_device(SERIAL).unwrap_err();
        assert_eq!(ErrorKind::of(&err), ErrorKind::DeviceUnavailable);
    }
}
