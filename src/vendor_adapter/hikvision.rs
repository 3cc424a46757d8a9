//! Hikvision ISAPI adapter
//!
//! Alarms arrive on `alertStream` as `<EventNotificationAlert>` documents.
//! Settings are read from ISAPI XML resources and written back by PUTting
//! the last reply with one tag rewritten.

use super::xml::{extract_blocks, extract_tag, parse_flag, replace_tag};
use super::{
    percent_value, switch_value, unsupported_command, AdapterContext, CameraBrand, CameraRequest,
    Channel, ChannelValue, EventSink, EventStream, ParseOutcome, VendorAdapter,
};
use crate::alarm_debouncer::AlarmDebouncer;
use crate::error::{Error, Result};
use crate::reply_store::ReplyStore;

const ALERT_STREAM: &str = "/ISAPI/Event/notification/alertStream";

pub struct HikvisionAdapter {
    ctx: AdapterContext,
    debouncer: AlarmDebouncer,
}

impl HikvisionAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            debouncer: AlarmDebouncer::default(),
        }
    }

    fn channel(&self) -> u32 {
        self.ctx.nvr_channel.max(1)
    }

    fn motion_path(&self) -> String {
        format!("/ISAPI/System/Video/inputs/channels/{}/motionDetection", self.channel())
    }

    fn line_path(&self) -> String {
        format!("/ISAPI/Smart/LineDetection/{}", self.channel())
    }

    fn field_path(&self) -> String {
        format!("/ISAPI/Smart/FieldDetection/{}", self.channel())
    }

    fn audio_path(&self) -> String {
        format!("/ISAPI/Smart/AudioDetection/channels/{}", self.channel())
    }

    fn io_path(&self) -> String {
        format!("/ISAPI/System/IO/inputs/{}", self.channel())
    }

    fn io_status_path(&self) -> String {
        format!("/ISAPI/System/IO/inputs/{}/status", self.channel())
    }

    /// True when the alert names this camera's channel
    fn for_this_channel(&self, alert: &str) -> bool {
        extract_tag(alert, "channelID")
            .or_else(|| extract_tag(alert, "dynChannelID"))
            .and_then(|id| id.parse::<u32>().ok())
            .map(|id| id == self.channel())
            .unwrap_or(false)
    }

    fn alert(&self, sink: &mut EventSink<'_>, alert: &str) {
        let Some(event_type) = extract_tag(alert, "eventType") else {
            return;
        };
        let active = extract_tag(alert, "eventState")
            .map(|s| s.eq_ignore_ascii_case("active"))
            .unwrap_or(false);
        if !active || !self.for_this_channel(alert) {
            return;
        }

        let channel = match event_type.to_ascii_lowercase().as_str() {
            "vmd" => Channel::MotionAlarm,
            "linedetection" => Channel::LineCrossingAlarm,
            "fielddetection" | "regionentrance" | "regionexiting" => Channel::FieldDetectionAlarm,
            "facedetection" => Channel::FaceDetected,
            "unattendedbaggage" => Channel::ItemLeft,
            "attendedbaggage" => Channel::ItemTaken,
            "pir" => Channel::PirAlarm,
            "shelteralarm" | "scenechangedetection" => Channel::TamperAlarm,
            "io" => Channel::ExternalAlarmInput,
            "audioexception" => Channel::AudioAlarm,
            _ => return,
        };
        sink.trigger(channel);
    }

    fn settings(&self, sink: &mut EventSink<'_>, path: &str, body: &str) {
        let enabled = extract_tag(body, "enabled").and_then(parse_flag);
        let sensitivity = extract_tag(body, "sensitivityLevel").and_then(|s| s.parse::<u8>().ok());

        if path == self.motion_path() {
            if let Some(on) = enabled {
                sink.switch(Channel::EnableMotionAlarm, on);
            }
            if let Some(level) = sensitivity {
                sink.percent(Channel::MotionThreshold, level);
            }
        } else if path == self.line_path() {
            if let Some(on) = enabled {
                sink.switch(Channel::EnableLineCrossingAlarm, on);
            }
        } else if path == self.field_path() {
            if let Some(on) = enabled {
                sink.switch(Channel::EnableFieldDetectionAlarm, on);
            }
        } else if path == self.audio_path() {
            if let Some(on) = enabled {
                sink.switch(Channel::EnableAudioAlarm, on);
            }
            if let Some(level) = sensitivity {
                sink.percent(Channel::ThresholdAudioAlarm, level);
            }
        } else if path == self.io_status_path() {
            if let Some(state) = extract_tag(body, "ioState") {
                sink.switch(Channel::ExternalAlarmInput, state.eq_ignore_ascii_case("active"));
            }
        } else if path == self.io_path() {
            if let Some(on) = enabled {
                sink.switch(Channel::EnableExternalAlarmInput, on);
            }
        }
    }

    /// PUT the stored reply for `path` back with `tag` set to `value`
    fn rewrite(&self, replies: &ReplyStore, path: String, tag: &str, value: &str) -> Result<CameraRequest> {
        let stored = replies
            .lookup_reply(&path)
            .ok_or_else(|| Error::NotFound(format!("no settings read back yet from {}", path)))?;
        let body = replace_tag(&stored, tag, value).ok_or_else(|| {
            Error::UnsupportedFeature(format!("{} has no <{}> to rewrite", path, tag))
        })?;
        Ok(CameraRequest::put(path.clone(), body).refreshing(path))
    }
}

fn is_unsupported(body: &str) -> bool {
    body.contains("Invalid Operation")
        || body.contains("notSupport")
        || body.contains("<subStatusCode>notSupport")
}

impl VendorAdapter for HikvisionAdapter {
    fn brand(&self) -> CameraBrand {
        CameraBrand::Hikvision
    }

    fn snapshot_path(&self) -> Option<String> {
        Some(format!("/ISAPI/Streaming/channels/{}01/picture", self.channel()))
    }

    fn mjpeg_path(&self) -> Option<String> {
        Some(format!("/ISAPI/Streaming/channels/{}02/httppreview", self.channel()))
    }

    fn high_priority_paths(&self) -> Vec<String> {
        Vec::new()
    }

    fn low_priority_paths(&self) -> Vec<String> {
        vec![
            self.motion_path(),
            self.line_path(),
            self.field_path(),
            self.audio_path(),
            self.io_path(),
            self.io_status_path(),
        ]
    }

    fn event_stream(&self) -> Option<EventStream> {
        Some(EventStream {
            path: ALERT_STREAM.to_string(),
            delimiter: "</EventNotificationAlert>",
        })
    }

    fn parse(&mut self, path: &str, body: &str) -> ParseOutcome {
        let mut debouncer = std::mem::take(&mut self.debouncer);
        let mut sink = EventSink::new(CameraBrand::Hikvision, &mut debouncer);

        if is_unsupported(body) {
            sink.unsupported(path);
        } else if body.contains("<eventType") {
            let mut alerts = extract_blocks(body, "EventNotificationAlert");
            if alerts.is_empty() {
                alerts.push(body);
            }
            for alert in alerts {
                self.alert(&mut sink, alert);
            }
        } else {
            self.settings(&mut sink, path, body);
        }

        let outcome = sink.finish();
        self.debouncer = debouncer;
        outcome
    }

    fn command(
        &self,
        channel: Channel,
        value: &ChannelValue,
        replies: &ReplyStore,
    ) -> Result<CameraRequest> {
        let flag = |on: bool| if on { "true" } else { "false" };
        match channel {
            Channel::EnableMotionAlarm => {
                let on = switch_value(value, channel)?;
                self.rewrite(replies, self.motion_path(), "enabled", flag(on))
            }
            Channel::MotionThreshold => {
                let level = percent_value(value, channel)?;
                self.rewrite(replies, self.motion_path(), "sensitivityLevel", &level.to_string())
            }
            Channel::EnableLineCrossingAlarm => {
                let on = switch_value(value, channel)?;
                self.rewrite(replies, self.line_path(), "enabled", flag(on))
            }
            Channel::EnableFieldDetectionAlarm => {
                let on = switch_value(value, channel)?;
                self.rewrite(replies, self.field_path(), "enabled", flag(on))
            }
            Channel::EnableAudioAlarm => {
                let on = switch_value(value, channel)?;
                self.rewrite(replies, self.audio_path(), "enabled", flag(on))
            }
            Channel::ThresholdAudioAlarm => {
                let level = percent_value(value, channel)?;
                self.rewrite(replies, self.audio_path(), "sensitivityLevel", &level.to_string())
            }
            Channel::EnableExternalAlarmInput => {
                let on = switch_value(value, channel)?;
                self.rewrite(replies, self.io_path(), "enabled", flag(on))
            }
            other => Err(unsupported_command(CameraBrand::Hikvision, other)),
        }
    }

    fn debouncer(&mut self) -> &mut AlarmDebouncer {
        &mut self.debouncer
    }
}
