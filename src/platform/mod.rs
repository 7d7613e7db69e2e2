// ABOUTME: Chat platform integrations for boardbot
// ABOUTME: Webex is the only platform; its clients implement the core collaborator traits

pub mod webex;

pub use webex::{
    BotIdentity, DeviceRegistry, StaticDeviceRegistry, WdmDeviceRegistry, WebexAdmin,
    WebexClient, WebexTokenEndpoint,
};
