use std::str::FromStr;

use crate::error::ConnectorError;

/// `HostName=..;SharedAccessKeyName=..;SharedAccessKey=..` as issued for a
/// hub access policy. `DeviceId` marks a string scoped to one device, which
/// the connector refuses since it connects many.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub shared_access_key_name: Option<String>,
    pub shared_access_key: String,
    pub device_id: Option<String>,
}

impl FromStr for ConnectionString {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut shared_access_key_name = None;
        let mut shared_access_key = None;
        let mut device_id = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            // Keys are base64 and may themselves end in '='
            let (name, value) = part.split_once('=').ok_or_else(|| {
                ConnectorError::Config(format!("connection string segment {:?} has no '='", part))
            })?;
            match name {
                "HostName" => host_name = Some(value.to_string()),
                "SharedAccessKeyName" => shared_access_key_name = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            host_name: host_name
                .ok_or_else(|| ConnectorError::Config("connection string has no HostName".into()))?,
            shared_access_key_name,
            shared_access_key: shared_access_key.ok_or_else(|| {
                ConnectorError::Config("connection string has no SharedAccessKey".into())
            })?,
            device_id,
        })
    }
}
