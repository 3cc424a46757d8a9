//! ONVIF discovery collaborator
//!
//! Capability discovery (media profiles, snapshot/stream URIs, PTZ probe)
//! and event pulling sit behind `OnvifDiscovery`. `SoapDiscovery` talks
//! SOAP with a WS-Security UsernameToken; `VendorDefaults` serves fixed
//! vendor URIs for cameras without a configured ONVIF port.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::auth_negotiator::AuthError;
use crate::config_store::CameraConfig;
use crate::error::{Error, Result};
use crate::vendor_adapter::xml::{attribute_in, extract_blocks, extract_tag};
use crate::vendor_adapter::CameraBrand;

/// One media profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaProfile {
    pub token: String,
    pub name: String,
}

/// What a health-tick reconnect learns about the camera
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub profiles: Vec<MediaProfile>,
    pub snapshot_uri: Option<String>,
    pub stream_uri: Option<String>,
    pub ptz_supported: bool,
}

#[async_trait]
pub trait OnvifDiscovery: Send + Sync {
    async fn profiles(&self) -> Result<Vec<MediaProfile>>;

    async fn snapshot_uri(&self, profile: &MediaProfile) -> Result<Option<String>>;

    async fn stream_uri(&self, profile: &MediaProfile) -> Result<Option<String>>;

    async fn ptz_supported(&self) -> Result<bool>;

    /// Raw notification XML since the last pull, `None` when there is nothing
    async fn pull_events(&self) -> Result<Option<String>>;
}

/// Enumerate profiles and resolve URIs for the configured profile index
pub async fn discover(discovery: &dyn OnvifDiscovery, profile_index: usize) -> Result<Capabilities> {
    let profiles = discovery.profiles().await?;
    let mut caps = Capabilities {
        ptz_supported: discovery.ptz_supported().await.unwrap_or(false),
        ..Default::default()
    };

    let selected = profiles.get(profile_index).or_else(|| profiles.first()).cloned();
    if let Some(profile) = selected {
        if profile_index >= profiles.len() {
            tracing::warn!(
                profile_index,
                available = profiles.len(),
                "ONVIF profile index out of range, using the first profile"
            );
        }
        caps.snapshot_uri = discovery.snapshot_uri(&profile).await?;
        caps.stream_uri = discovery.stream_uri(&profile).await?;
    }
    caps.profiles = profiles;

    Ok(caps)
}

/// Generate WS-Security UsernameToken Digest header for ONVIF authentication
pub fn ws_security_header(username: &str, password: &str) -> String {
    let nonce_bytes: [u8; 16] = rand::thread_rng().gen();
    let nonce_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, nonce_bytes);
    let created = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    // PasswordDigest = Base64(SHA1(nonce + created + password))
    let mut hasher = Sha1::new();
    hasher.update(nonce_bytes);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    let digest_b64 =
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hasher.finalize());

    format!(
        r#"<wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd" xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd"><wsse:UsernameToken><wsse:Username>{}</wsse:Username><wsse:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest">{}</wsse:Password><wsse:Nonce EncodingType="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary">{}</wsse:Nonce><wsu:Created>{}</wsu:Created></wsse:UsernameToken></wsse:Security>"#,
        username, digest_b64, nonce_b64, created
    )
}

fn unescape(value: &str) -> String {
    value.replace("&amp;", "&")
}

/// Every `<...Profiles token="..">` in a GetProfiles response
fn parse_profiles(body: &str) -> Vec<MediaProfile> {
    body.split("Profiles")
        .skip(1)
        .filter(|fragment| fragment.starts_with(char::is_whitespace))
        .filter_map(|fragment| {
            let start_tag = fragment.split('>').next()?;
            let token = attribute_in(start_tag, "token")?;
            Some(MediaProfile {
                token: token.to_string(),
                name: extract_tag(fragment, "Name").unwrap_or(token).to_string(),
            })
        })
        .collect()
}

/// Service endpoints from GetCapabilities
#[derive(Debug, Clone, Default)]
struct ServiceAddrs {
    media: Option<String>,
    ptz: Option<String>,
    events: Option<String>,
}

fn capability_xaddr(body: &str, capability: &str) -> Option<String> {
    extract_blocks(body, capability)
        .into_iter()
        .find_map(|block| extract_tag(block, "XAddr"))
        .map(unescape)
}

/// SOAP-over-HTTP ONVIF client
pub struct SoapDiscovery {
    client: reqwest::Client,
    device_url: String,
    username: String,
    password: String,
    services: Mutex<Option<ServiceAddrs>>,
    pull_point: Mutex<Option<String>>,
}

impl SoapDiscovery {
    pub fn new(
        address: &str,
        onvif_port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            device_url: format!("http://{}:{}/onvif/device_service", address, onvif_port),
            username: username.into(),
            password: password.into(),
            services: Mutex::new(None),
            pull_point: Mutex::new(None),
        })
    }

    async fn call(&self, url: &str, body: &str) -> Result<String> {
        let envelope = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:tt="http://www.onvif.org/ver10/schema"><s:Header>{}</s:Header><s:Body>{}</s:Body></s:Envelope>"#,
            ws_security_header(&self.username, &self.password),
            body
        );

        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("{}: {}", url, e)))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Connectivity(format!("{}: {}", url, e)))?;

        if text.contains("NotAuthorized") || status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::Unavailable("ONVIF request not authorized".to_string()).into());
        }
        if !status.is_success() || text.contains("Fault>") {
            let reason = extract_tag(&text, "Text").unwrap_or("SOAP fault");
            return Err(Error::UnsupportedFeature(format!("{}: {}", url, reason)));
        }
        Ok(text)
    }

    async fn services(&self) -> Result<ServiceAddrs> {
        if let Some(services) = self.services.lock().clone() {
            return Ok(services);
        }
        let body = self
            .call(
                &self.device_url,
                r#"<GetCapabilities xmlns="http://www.onvif.org/ver10/device/wsdl"><Category>All</Category></GetCapabilities>"#,
            )
            .await?;
        let services = ServiceAddrs {
            media: capability_xaddr(&body, "Media"),
            ptz: capability_xaddr(&body, "PTZ"),
            events: capability_xaddr(&body, "Events"),
        };
        *self.services.lock() = Some(services.clone());
        Ok(services)
    }

    async fn media_url(&self) -> Result<String> {
        Ok(self
            .services()
            .await?
            .media
            .unwrap_or_else(|| self.device_url.replace("device_service", "media_service")))
    }

    async fn subscribe(&self) -> Result<String> {
        let events = self
            .services()
            .await?
            .events
            .ok_or_else(|| Error::UnsupportedFeature("camera has no ONVIF event service".to_string()))?;
        let body = self
            .call(
                &events,
                r#"<CreatePullPointSubscription xmlns="http://www.onvif.org/ver10/events/wsdl"><InitialTerminationTime>PT600S</InitialTerminationTime></CreatePullPointSubscription>"#,
            )
            .await?;
        let address = extract_blocks(&body, "SubscriptionReference")
            .into_iter()
            .find_map(|block| extract_tag(block, "Address"))
            .map(unescape)
            .ok_or_else(|| Error::UnsupportedFeature("pull-point subscription has no address".to_string()))?;
        tracing::debug!(pull_point = %address, "ONVIF pull-point subscription created");
        *self.pull_point.lock() = Some(address.clone());
        Ok(address)
    }
}

#[async_trait]
impl OnvifDiscovery for SoapDiscovery {
    async fn profiles(&self) -> Result<Vec<MediaProfile>> {
        let media = self.media_url().await?;
        let body = self
            .call(&media, r#"<GetProfiles xmlns="http://www.onvif.org/ver10/media/wsdl"/>"#)
            .await?;
        Ok(parse_profiles(&body))
    }

    async fn snapshot_uri(&self, profile: &MediaProfile) -> Result<Option<String>> {
        let media = self.media_url().await?;
        let body = self
            .call(
                &media,
                &format!(
                    r#"<GetSnapshotUri xmlns="http://www.onvif.org/ver10/media/wsdl"><ProfileToken>{}</ProfileToken></GetSnapshotUri>"#,
                    profile.token
                ),
            )
            .await?;
        Ok(extract_tag(&body, "Uri").map(unescape))
    }

    async fn stream_uri(&self, profile: &MediaProfile) -> Result<Option<String>> {
        let media = self.media_url().await?;
        let body = self
            .call(
                &media,
                &format!(
                    r#"<GetStreamUri xmlns="http://www.onvif.org/ver10/media/wsdl"><StreamSetup><tt:Stream>RTP-Unicast</tt:Stream><tt:Transport><tt:Protocol>RTSP</tt:Protocol></tt:Transport></StreamSetup><ProfileToken>{}</ProfileToken></GetStreamUri>"#,
                    profile.token
                ),
            )
            .await?;
        Ok(extract_tag(&body, "Uri").map(unescape))
    }

    async fn ptz_supported(&self) -> Result<bool> {
        Ok(self.services().await?.ptz.is_some())
    }

    async fn pull_events(&self) -> Result<Option<String>> {
        let existing = self.pull_point.lock().clone();
        let address = match existing {
            Some(address) => address,
            None => self.subscribe().await?,
        };

        let result = self
            .call(
                &address,
                r#"<PullMessages xmlns="http://www.onvif.org/ver10/events/wsdl"><Timeout>PT1S</Timeout><MessageLimit>10</MessageLimit></PullMessages>"#,
            )
            .await;

        match result {
            Ok(body) if body.contains("NotificationMessage") => Ok(Some(body)),
            Ok(_) => Ok(None),
            Err(e) => {
                // Subscription expired or was dropped; renew on the next pull
                *self.pull_point.lock() = None;
                Err(e)
            }
        }
    }
}

/// Fixed URIs for cameras without an ONVIF service
#[derive(Debug, Clone, Default)]
pub struct VendorDefaults {
    pub snapshot_uri: Option<String>,
    pub stream_uri: Option<String>,
}

impl VendorDefaults {
    /// Documented RTSP/HTTP stream locations per brand
    pub fn for_camera(config: &CameraConfig) -> Self {
        let host = &config.address;
        let ch = config.nvr_channel.max(1);
        let stream_uri = match config.brand {
            CameraBrand::Hikvision => Some(format!("rtsp://{}:554/Streaming/Channels/{}01", host, ch)),
            CameraBrand::Dahua | CameraBrand::Amcrest => Some(format!(
                "rtsp://{}:554/cam/realmonitor?channel={}&subtype=0",
                host, ch
            )),
            CameraBrand::Foscam => Some(format!("rtsp://{}:{}/videoMain", host, config.port)),
            CameraBrand::Instar => Some(format!("rtsp://{}:554/11", host)),
            CameraBrand::Doorbird => Some(format!("http://{}/bha-api/video.cgi", host)),
            CameraBrand::Onvif => None,
        };
        Self {
            snapshot_uri: None,
            stream_uri,
        }
    }
}

#[async_trait]
impl OnvifDiscovery for VendorDefaults {
    async fn profiles(&self) -> Result<Vec<MediaProfile>> {
        Ok(vec![MediaProfile {
            token: "vendor".to_string(),
            name: "vendor".to_string(),
        }])
    }

    async fn snapshot_uri(&self, _profile: &MediaProfile) -> Result<Option<String>> {
        Ok(self.snapshot_uri.clone())
    }

    async fn stream_uri(&self, _profile: &MediaProfile) -> Result<Option<String>> {
        Ok(self.stream_uri.clone())
    }

    async fn ptz_supported(&self) -> Result<bool> {
        Ok(false)
    }

    async fn pull_events(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profiles() {
        let body = r#"<trt:GetProfilesResponse>
<trt:Profiles token="Profile_1" fixed="true"><tt:Name>mainStream</tt:Name><tt:VideoSourceConfiguration token="V1"/></trt:Profiles>
<trt:Profiles token="Profile_2" fixed="true"><tt:Name>subStream</tt:Name></trt:Profiles>
</trt:GetProfilesResponse>"#;
        let profiles = parse_profiles(body);
        assert_eq!(
            profiles,
            vec![
                MediaProfile { token: "Profile_1".into(), name: "mainStream".into() },
                MediaProfile { token: "Profile_2".into(), name: "subStream".into() },
            ]
        );
    }

    #[test]
    fn test_capability_xaddr() {
        let body = "<tt:Capabilities><tt:Events><tt:XAddr>http://10.0.0.2/onvif/Events</tt:XAddr></tt:Events>\
                    <tt:Media><tt:XAddr>http://10.0.0.2/onvif/Media?a=1&amp;b=2</tt:XAddr></tt:Media></tt:Capabilities>";
        assert_eq!(capability_xaddr(body, "Media").as_deref(), Some("http://10.0.0.2/onvif/Media?a=1&b=2"));
        assert_eq!(capability_xaddr(body, "Events").as_deref(), Some("http://10.0.0.2/onvif/Events"));
        assert_eq!(capability_xaddr(body, "PTZ"), None);
    }

    #[test]
    fn test_ws_security_header_shape() {
        let header = ws_security_header("admin", "secret");
        assert!(header.contains("<wsse:Username>admin</wsse:Username>"));
        assert!(header.contains("#PasswordDigest\">"));
        assert!(!header.contains("secret"));
    }

    #[tokio::test]
    async fn test_discover_with_vendor_defaults() {
        let defaults = VendorDefaults {
            snapshot_uri: Some("/tmpfs/snap.jpg".to_string()),
            stream_uri: None,
        };
        let caps = discover(&defaults, 3).await.unwrap();
        assert_eq!(caps.profiles.len(), 1);
        assert_eq!(caps.snapshot_uri.as_deref(), Some("/tmpfs/snap.jpg"));
        assert!(!caps.ptz_supported);
    }
}
