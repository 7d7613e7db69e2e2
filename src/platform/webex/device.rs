// ABOUTME: Device registration that yields the event-stream websocket URL for the bot
// ABOUTME: Reuses an existing device with the configured name, otherwise registers a new one

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ensure_success, http_client};

/// Connection details for the event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub device_url: Option<String>,
    pub websocket_url: String,
}

/// Source of the event-stream descriptor
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn descriptor(&self) -> Result<DeviceDescriptor>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Device {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    web_socket_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<Device>,
}

/// Registers the bot with the Webex device manager
pub struct WdmDeviceRegistry {
    http: reqwest::Client,
    devices_url: String,
    device_name: String,
    token: String,
}

impl WdmDeviceRegistry {
    pub fn new(
        devices_url: impl Into<String>,
        device_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            devices_url: devices_url.into(),
            device_name: device_name.into(),
            token: token.into(),
        })
    }

    async fn existing(&self) -> Result<Option<Device>> {
        let response = self
            .http
            .get(&self.devices_url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("Listing devices failed")?;
        if !response.status().is_success() {
            tracing::info!(status = %response.status(), "No device list available, registering a new device");
            return Ok(None);
        }
        let list: DeviceList = response
            .json()
            .await
            .context("Device list has an unexpected shape")?;
        Ok(list
            .devices
            .into_iter()
            .find(|d| d.name.as_deref() == Some(self.device_name.as_str())))
    }

    async fn register(&self) -> Result<Device> {
        let body = json!({
            "deviceName": self.device_name,
            "deviceType": "DESKTOP",
            "localizedModel": "rust",
            "model": "rust",
            "name": self.device_name,
            "systemName": self.device_name,
            "systemVersion": env!("CARGO_PKG_VERSION"),
        });
        let response = self
            .http
            .post(&self.devices_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("Registering device failed")?;
        ensure_success(response, "Device registration")
            .await?
            .json()
            .await
            .context("Device registration returned an unexpected body")
    }
}

#[async_trait]
impl DeviceRegistry for WdmDeviceRegistry {
    async fn descriptor(&self) -> Result<DeviceDescriptor> {
        let device = match self.existing().await? {
            Some(device) => {
                tracing::info!(device_url = ?device.url, "Using existing device");
                device
            }
            None => {
                let device = self.register().await?;
                tracing::info!(device_url = ?device.url, "Registered new device");
                device
            }
        };
        let websocket_url = device
            .web_socket_url
            .filter(|u| !u.is_empty())
            .context("Device descriptor has no webSocketUrl")?;
        Ok(DeviceDescriptor {
            device_url: device.url,
            websocket_url,
        })
    }
}

/// Descriptor that always points at a fixed URL
#[derive(Debug, Clone)]
pub struct StaticDeviceRegistry {
    websocket_url: String,
}

impl StaticDeviceRegistry {
    pub fn new(websocket_url: impl Into<String>) -> Self {
        Self {
            websocket_url: websocket_url.into(),
        }
    }
}

#[async_trait]
impl DeviceRegistry for StaticDeviceRegistry {
    async fn descriptor(&self) -> Result<DeviceDescriptor> {
        Ok(DeviceDescriptor {
            device_url: None,
            websocket_url: self.websocket_url.clone(),
        })
    }
}
