//! VendorAdapter - vendor wire formats onto canonical channels
//!
//! ## Responsibilities
//!
//! - One adapter per camera brand, selected from the configured brand
//! - Turn raw reply/push bodies into canonical `AlarmEvent`s by plain
//!   substring and flat-tag matching
//! - Own the brand's debounce counters
//! - Name the endpoints the scheduler polls and build command requests
//!
//! Unrecognised content is not an error: heartbeats and unknown tokens
//! produce an empty outcome.

mod dahua;
mod doorbird;
mod foscam;
mod hikvision;
mod instar;
mod onvif;
pub mod xml;

pub use dahua::DahuaAdapter;
pub use doorbird::DoorBirdAdapter;
pub use foscam::FoscamAdapter;
pub use hikvision::HikvisionAdapter;
pub use instar::InstarAdapter;
pub use onvif::OnvifAdapter;

use std::fmt;
use std::str::FromStr;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::alarm_debouncer::{AlarmDebouncer, Raise};
use crate::error::Result;
use crate::reply_store::ReplyStore;

/// Camera brand discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBrand {
    Onvif,
    Dahua,
    Amcrest,
    Foscam,
    Hikvision,
    Instar,
    Doorbird,
}

impl CameraBrand {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraBrand::Onvif => "onvif",
            CameraBrand::Dahua => "dahua",
            CameraBrand::Amcrest => "amcrest",
            CameraBrand::Foscam => "foscam",
            CameraBrand::Hikvision => "hikvision",
            CameraBrand::Instar => "instar",
            CameraBrand::Doorbird => "doorbird",
        }
    }
}

impl fmt::Display for CameraBrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! channels {
    ($($variant:ident => $id:literal),+ $(,)?) => {
        /// Canonical channel, independent of vendor wire format
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum Channel {
            $($variant),+
        }

        impl Channel {
            pub const ALL: &'static [Channel] = &[$(Channel::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Channel::$variant => $id),+
                }
            }
        }

        impl FromStr for Channel {
            type Err = crate::error::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($id => Ok(Channel::$variant),)+
                    other => Err(crate::error::Error::NotFound(format!("unknown channel {}", other))),
                }
            }
        }
    };
}

channels! {
    MotionAlarm => "motion_alarm",
    EnableMotionAlarm => "enable_motion_alarm",
    MotionThreshold => "motion_threshold",
    AudioAlarm => "audio_alarm",
    EnableAudioAlarm => "enable_audio_alarm",
    ThresholdAudioAlarm => "threshold_audio_alarm",
    LineCrossingAlarm => "line_crossing_alarm",
    EnableLineCrossingAlarm => "enable_line_crossing_alarm",
    FieldDetectionAlarm => "field_detection_alarm",
    EnableFieldDetectionAlarm => "enable_field_detection_alarm",
    FaceDetected => "face_detected",
    ItemLeft => "item_left",
    ItemTaken => "item_taken",
    ExternalAlarmInput => "external_alarm_input",
    EnableExternalAlarmInput => "enable_external_alarm_input",
    PirAlarm => "pir_alarm",
    TamperAlarm => "tamper_alarm",
    HumanAlarm => "human_alarm",
    CarAlarm => "car_alarm",
    ParkingAlarm => "parking_alarm",
    Doorbell => "doorbell",
    EnablePrivacyMode => "enable_privacy_mode",
    ExternalLight => "external_light",
    DoorRelay => "door_relay",
    LastMotionType => "last_motion_type",
}

impl Channel {
    /// Alarms that count as "motion" for snapshot refresh and last-motion-type
    pub fn is_motion_class(&self) -> bool {
        matches!(
            self,
            Channel::MotionAlarm
                | Channel::LineCrossingAlarm
                | Channel::FieldDetectionAlarm
                | Channel::FaceDetected
                | Channel::PirAlarm
                | Channel::HumanAlarm
                | Channel::CarAlarm
                | Channel::Doorbell
        )
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical channel value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Switch(bool),
    Percent(u8),
    Text(String),
}

impl ChannelValue {
    pub fn as_switch(&self) -> Option<bool> {
        match self {
            ChannelValue::Switch(b) => Some(*b),
            ChannelValue::Percent(p) => Some(*p > 0),
            ChannelValue::Text(t) => match t.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" => Some(true),
                "off" | "false" | "0" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_percent(&self) -> Option<u8> {
        match self {
            ChannelValue::Percent(p) => Some((*p).min(100)),
            ChannelValue::Switch(b) => Some(if *b { 100 } else { 0 }),
            ChannelValue::Text(t) => t.trim().parse::<u8>().ok().map(|p| p.min(100)),
        }
    }
}

/// One canonical update produced by an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmEvent {
    pub channel: Channel,
    pub value: ChannelValue,
    pub vendor: CameraBrand,
    /// Poll cycles left before auto-clear (0 when not counting down)
    pub ttl: u8,
    /// First occurrence after idle
    #[serde(skip)]
    pub fresh: bool,
}

/// Everything one parse produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    pub events: Vec<AlarmEvent>,
    /// Low-priority paths the camera reported as unsupported
    pub unsupported: Vec<String>,
}

impl ParseOutcome {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.unsupported.is_empty()
    }

    /// Latest value emitted for `channel`
    pub fn value_of(&self, channel: Channel) -> Option<&ChannelValue> {
        self.events
            .iter()
            .rev()
            .find(|e| e.channel == channel)
            .map(|e| &e.value)
    }

    pub fn count_of(&self, channel: Channel) -> usize {
        self.events.iter().filter(|e| e.channel == channel).count()
    }
}

/// Long-lived event stream a vendor pushes over chunked HTTP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStream {
    pub path: String,
    /// Marker separating parts in the stream
    pub delimiter: &'static str,
}

/// A request an adapter wants sent to the camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<String>,
    /// Settings path to re-read once the request succeeds
    pub refresh: Option<String>,
}

impl CameraRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            refresh: None,
        }
    }

    pub fn put(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::PUT,
            path: path.into(),
            body: Some(body.into()),
            refresh: None,
        }
    }

    pub fn refreshing(mut self, path: impl Into<String>) -> Self {
        self.refresh = Some(path.into());
        self
    }
}

/// Camera details an adapter needs to build paths
#[derive(Debug, Clone, Default)]
pub struct AdapterContext {
    pub username: String,
    pub password: String,
    /// NVR/multi-channel index, 1-based
    pub nvr_channel: u32,
}

/// Vendor protocol adapter
pub trait VendorAdapter: Send + Sync {
    fn brand(&self) -> CameraBrand;

    /// Snapshot path when discovery supplies none
    fn snapshot_path(&self) -> Option<String>;

    /// Path of a camera-native MJPEG stream
    fn mjpeg_path(&self) -> Option<String> {
        None
    }

    /// Primary alarm-status endpoints, polled every high-priority tick
    fn high_priority_paths(&self) -> Vec<String>;

    /// Secondary endpoints, one per low-priority tick
    fn low_priority_paths(&self) -> Vec<String>;

    fn event_stream(&self) -> Option<EventStream> {
        None
    }

    /// Parse a reply to `path`
    fn parse(&mut self, path: &str, body: &str) -> ParseOutcome;

    /// Parse camera-initiated push data arriving at `uri` on the media server
    fn push(&mut self, uri: &str, body: &str) -> ParseOutcome {
        self.parse(uri, body)
    }

    /// Build the request that writes `value` to `channel`
    fn command(
        &self,
        channel: Channel,
        value: &ChannelValue,
        replies: &ReplyStore,
    ) -> Result<CameraRequest>;

    fn debouncer(&mut self) -> &mut AlarmDebouncer;

    /// Scheduler tick: countdown-held channels that fell back to OFF
    fn tick(&mut self) -> Vec<AlarmEvent> {
        let brand = self.brand();
        switched_off(brand, self.debouncer().tick())
    }

    /// Camera went offline: every held alarm falls back to OFF
    fn release_alarms(&mut self) -> Vec<AlarmEvent> {
        let brand = self.brand();
        switched_off(brand, self.debouncer().release_all())
    }
}

fn switched_off(vendor: CameraBrand, channels: Vec<Channel>) -> Vec<AlarmEvent> {
    channels
        .into_iter()
        .map(|channel| AlarmEvent {
            channel,
            value: ChannelValue::Switch(false),
            vendor,
            ttl: 0,
            fresh: false,
        })
        .collect()
}

/// Build the adapter for `brand`
pub fn create_adapter(brand: CameraBrand, ctx: AdapterContext) -> Box<dyn VendorAdapter> {
    match brand {
        CameraBrand::Onvif => Box::new(OnvifAdapter::new()),
        CameraBrand::Dahua => Box::new(DahuaAdapter::new(ctx, false)),
        CameraBrand::Amcrest => Box::new(DahuaAdapter::new(ctx, true)),
        CameraBrand::Foscam => Box::new(FoscamAdapter::new(ctx)),
        CameraBrand::Hikvision => Box::new(HikvisionAdapter::new(ctx)),
        CameraBrand::Instar => Box::new(InstarAdapter::new()),
        CameraBrand::Doorbird => Box::new(DoorBirdAdapter::new()),
    }
}

/// Collects events for one parse, routing raises through the debouncer
pub(crate) struct EventSink<'a> {
    brand: CameraBrand,
    debouncer: &'a mut AlarmDebouncer,
    outcome: ParseOutcome,
}

impl<'a> EventSink<'a> {
    pub(crate) fn new(brand: CameraBrand, debouncer: &'a mut AlarmDebouncer) -> Self {
        Self {
            brand,
            debouncer,
            outcome: ParseOutcome::default(),
        }
    }

    fn emit(&mut self, channel: Channel, value: ChannelValue, ttl: u8, fresh: bool) {
        self.outcome.events.push(AlarmEvent {
            channel,
            value,
            vendor: self.brand,
            ttl,
            fresh,
        });
    }

    /// Level state the device itself holds
    pub(crate) fn switch(&mut self, channel: Channel, on: bool) {
        self.emit(channel, ChannelValue::Switch(on), 0, false);
    }

    pub(crate) fn percent(&mut self, channel: Channel, value: u8) {
        self.emit(channel, ChannelValue::Percent(value.min(100)), 0, false);
    }

    /// Polled edge: hold with a countdown
    pub(crate) fn trigger(&mut self, channel: Channel) {
        let raise = self.debouncer.trigger(channel);
        let ttl = self.debouncer.remaining(channel);
        self.raised(channel, raise, ttl);
    }

    /// Edge with a matching stop token: hold until `clear`
    pub(crate) fn latch(&mut self, channel: Channel) {
        let raise = self.debouncer.latch(channel);
        self.raised(channel, raise, 0);
    }

    pub(crate) fn clear(&mut self, channel: Channel) {
        self.debouncer.clear(channel);
        self.switch(channel, false);
    }

    pub(crate) fn unsupported(&mut self, path: &str) {
        self.outcome.unsupported.push(path.to_string());
    }

    pub(crate) fn finish(self) -> ParseOutcome {
        self.outcome
    }

    fn raised(&mut self, channel: Channel, raise: Raise, ttl: u8) {
        let fresh = raise == Raise::Raised;
        self.emit(channel, ChannelValue::Switch(true), ttl, fresh);
        if fresh && channel.is_motion_class() {
            self.emit(
                Channel::LastMotionType,
                ChannelValue::Text(channel.as_str().to_string()),
                0,
                false,
            );
        }
    }
}

/// Map discrete vendor level `code` in `0..=max` onto 0-100
pub fn level_to_percent(code: u32, max: u32) -> u8 {
    if max == 0 {
        return 0;
    }
    ((code.min(max) * 100) / max) as u8
}

/// Map 0-100 onto the nearest discrete vendor level in `0..=max`
pub fn percent_to_level(percent: u8, max: u32) -> u32 {
    ((percent.min(100) as u32 * max) + 50) / 100
}

fn switch_value(value: &ChannelValue, channel: Channel) -> Result<bool> {
    value.as_switch().ok_or_else(|| {
        crate::error::Error::Validation(format!("{} expects ON/OFF, got {:?}", channel, value))
    })
}

fn percent_value(value: &ChannelValue, channel: Channel) -> Result<u8> {
    value.as_percent().ok_or_else(|| {
        crate::error::Error::Validation(format!("{} expects 0-100, got {:?}", channel, value))
    })
}

fn unsupported_command(brand: CameraBrand, channel: Channel) -> crate::error::Error {
    crate::error::Error::UnsupportedFeature(format!("{} cameras do not accept {}", brand, channel))
}
