use std::{error::Error, sync::Arc};

use anyhow::{Context, Result};
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use crate::{
    adb::{Transport, shell},
    error::ExplorerError,
    models::{ConnectTarget, Device, UNKNOWN_DEVICE_NAME},
    task::Job,
};

/// Enumerates attached devices, unauthorized and offline ones included
#[instrument(level = "debug", skip(transport), err)]
pub async fn discover(transport: &dyn Transport) -> Result<Vec<Device>> {
    let devices: Vec<Device> =
        transport.devices().await.context("Failed to list devices")?.iter().map(|r| r.to_device()).collect();
    debug!(count = devices.len(), "Discovered devices");
    Ok(devices)
}

/// Dials `target` and returns it once it is listed and ready
#[instrument(level = "debug", skip(transport), err)]
pub async fn connect(transport: &dyn Transport, target: &ConnectTarget) -> Result<Device> {
    let serial = transport.connect(target).await?;
    let record = transport
        .devices()
        .await
        .context("Failed to list devices")?
        .into_iter()
        .find(|r| r.serial == serial)
        .ok_or_else(|| ExplorerError::DeviceUnavailable(format!("{serial} is not attached")))?;
    let mut device = record.to_device();
    if !device.is_available() {
        return Err(ExplorerError::DeviceUnavailable(format!("{serial} is {}", device.state)).into());
    }

    match query_model(transport, &serial).await {
        Ok(Some(model)) => device.display_name = model,
        Ok(None) => {}
        Err(e) => warn!(error = e.as_ref() as &dyn Error, serial, "Failed to read device model"),
    }
    info!(serial, name = %device.display_name, "Device connected");
    Ok(device)
}

/// `ro.product.model`, `None` if it is empty
async fn query_model(transport: &dyn Transport, serial: &str) -> Result<Option<String>> {
    let argv = shell::getprop("ro.product.model");
    let model = transport.execute(serial, &argv).await?.into_checked(&argv)?;
    let model = model.trim();
    Ok((!model.is_empty() && model != UNKNOWN_DEVICE_NAME).then(|| model.to_string()))
}

/// Drops a network device. USB devices have nothing to hang up.
#[instrument(level = "debug", skip(transport), err)]
pub async fn disconnect(transport: &dyn Transport, device: &Device) -> Result<String> {
    if !device.is_wireless() {
        return Ok(device.id.clone());
    }
    let message = transport.disconnect(&device.id).await?;
    debug!(serial = %device.id, %message, "Disconnected");
    Ok(device.id.clone())
}

/// Known devices and the one being browsed
#[derive(Debug)]
pub struct DeviceRegistry {
    transport: Arc<dyn Transport>,
    devices: Vec<Device>,
    active: Option<Device>,
}

impl DeviceRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, devices: Vec::new(), active: None }
    }

    pub fn discover_job(&self) -> Job<Vec<Device>> {
        let transport = self.transport.clone();
        async move { discover(transport.as_ref()).await }.boxed()
    }

    /// Parses `target` up front so a bad address never reaches the transport
    pub fn connect_job(&self, target: &str) -> Result<Job<Device>> {
        let target = ConnectTarget::parse(target)?;
        let transport = self.transport.clone();
        Ok(async move { connect(transport.as_ref(), &target).await }.boxed())
    }

    pub fn disconnect_job(&self, device: &Device) -> Job<String> {
        let transport = self.transport.clone();
        let device = device.clone();
        async move { disconnect(transport.as_ref(), &device).await }.boxed()
    }

    /// Replaces the known list, keeping the active device's entry current
    pub fn remember(&mut self, devices: Vec<Device>) {
        if let Some(active) = &mut self.active
            && let Some(fresh) = devices.iter().find(|d| d.id == active.id)
        {
            *active = fresh.clone();
        }
        self.devices = devices;
    }

    /// Adds or updates one device, e.g. after a successful connect
    pub fn upsert(&mut self, device: Device) {
        match self.devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device,
            None => self.devices.push(device),
        }
    }

    pub fn forget(&mut self, id: &str) {
        self.devices.retain(|d| d.id != id);
        if self.active.as_ref().is_some_and(|d| d.id == id) {
            self.active = None;
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn active(&self) -> Option<&Device> {
        self.active.as_ref()
    }

    pub fn set_active(&mut self, device: Device) {
        self.active = Some(device);
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    pub fn find(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}
