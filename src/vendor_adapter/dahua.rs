//! Dahua / Amcrest CGI adapter
//!
//! Dahua firmware pushes `Code=...;action=Start|Stop;index=N` lines over
//! `eventManager.cgi?action=attach`. Amcrest units that drop the attach
//! connection are polled with `getEventIndexes` instead, which only reports
//! "currently active", so those alarms count down.

use super::xml::{extract_kv, parse_flag};
use super::{
    level_to_percent, percent_to_level, percent_value, switch_value, unsupported_command,
    AdapterContext, CameraBrand, CameraRequest, Channel, ChannelValue, EventSink, EventStream,
    ParseOutcome, VendorAdapter,
};
use crate::alarm_debouncer::AlarmDebouncer;
use crate::error::Result;
use crate::reply_store::ReplyStore;

const CONFIG: &str = "/cgi-bin/configManager.cgi?action=";
const EVENT_INDEXES: &str = "/cgi-bin/eventManager.cgi?action=getEventIndexes&code=";
const MOTION_LEVEL_MAX: u32 = 6;

pub struct DahuaAdapter {
    ctx: AdapterContext,
    /// Poll `getEventIndexes` instead of holding an attach stream
    polled: bool,
    debouncer: AlarmDebouncer,
}

/// Event code to canonical channel
fn code_channel(code: &str) -> Option<Channel> {
    let channel = match code {
        "VideoMotion" => Channel::MotionAlarm,
        "AudioMutation" | "AudioAnomaly" => Channel::AudioAlarm,
        "CrossLineDetection" => Channel::LineCrossingAlarm,
        "CrossRegionDetection" => Channel::FieldDetectionAlarm,
        "FaceDetection" => Channel::FaceDetected,
        "LeftDetection" => Channel::ItemLeft,
        "TakenAwayDetection" => Channel::ItemTaken,
        "AlarmLocal" => Channel::ExternalAlarmInput,
        "ParkingDetection" => Channel::ParkingAlarm,
        "SmartMotionHuman" => Channel::HumanAlarm,
        "SmartMotionVehicle" => Channel::CarAlarm,
        "VideoBlind" => Channel::TamperAlarm,
        "CallNoAnswered" | "DoorBell" => Channel::Doorbell,
        _ => return None,
    };
    Some(channel)
}

impl DahuaAdapter {
    pub fn new(ctx: AdapterContext, polled: bool) -> Self {
        Self {
            ctx,
            polled,
            debouncer: AlarmDebouncer::default(),
        }
    }

    /// Zero-based index Dahua uses in tables and events
    fn index(&self) -> u32 {
        self.ctx.nvr_channel.max(1) - 1
    }

    fn get_config(name: &str) -> String {
        format!("{}getConfig&name={}", CONFIG, name)
    }

    fn set_config(&self, table: &str, field: &str, value: impl std::fmt::Display) -> String {
        format!("{}setConfig&{}[{}].{}={}", CONFIG, table, self.index(), field, value)
    }

    fn table_key(&self, table: &str, field: &str) -> String {
        format!("table.{}[{}].{}", table, self.index(), field)
    }

    fn brand_id(&self) -> CameraBrand {
        if self.polled {
            CameraBrand::Amcrest
        } else {
            CameraBrand::Dahua
        }
    }
}

/// One `Code=...;action=...;index=...` line
fn stream_line(sink: &mut EventSink<'_>, index: u32, line: &str) {
    let Some(code) = extract_kv(line, "Code") else {
        return;
    };
    let Some(channel) = code_channel(code) else {
        return;
    };
    if let Some(idx) = extract_kv(line, "index").and_then(|i| i.parse::<u32>().ok()) {
        if idx != index {
            return;
        }
    }
    match extract_kv(line, "action") {
        Some("Start") => sink.latch(channel),
        Some("Stop") => sink.clear(channel),
        Some("Pulse") => sink.trigger(channel),
        _ => {}
    }
}

impl VendorAdapter for DahuaAdapter {
    fn brand(&self) -> CameraBrand {
        self.brand_id()
    }

    fn snapshot_path(&self) -> Option<String> {
        Some(format!("/cgi-bin/snapshot.cgi?channel={}", self.index() + 1))
    }

    fn mjpeg_path(&self) -> Option<String> {
        Some(format!(
            "/cgi-bin/mjpg/video.cgi?channel={}&subtype=1",
            self.index() + 1
        ))
    }

    fn high_priority_paths(&self) -> Vec<String> {
        if self.polled {
            vec![
                format!("{}VideoMotion", EVENT_INDEXES),
                format!("{}AudioMutation", EVENT_INDEXES),
            ]
        } else {
            Vec::new()
        }
    }

    fn low_priority_paths(&self) -> Vec<String> {
        vec![
            Self::get_config("MotionDetect"),
            Self::get_config("AudioDetect"),
            Self::get_config("LeLensMask"),
            Self::get_config("Alarm"),
        ]
    }

    fn event_stream(&self) -> Option<EventStream> {
        if self.polled {
            return None;
        }
        Some(EventStream {
            path: "/cgi-bin/eventManager.cgi?action=attach&codes=[All]".to_string(),
            delimiter: "--myboundary",
        })
    }

    fn parse(&mut self, path: &str, body: &str) -> ParseOutcome {
        let index = self.index();
        let motion_enable = self.table_key("MotionDetect", "Enable");
        let motion_level = self.table_key("MotionDetect", "Level");
        let audio_enable = self.table_key("AudioDetect", "MutationDetect");
        let audio_threshold = self.table_key("AudioDetect", "MutationThreold");
        let privacy = self.table_key("LeLensMask", "Enable");
        let alarm_input = self.table_key("Alarm", "Enable");

        let mut sink = EventSink::new(self.brand_id(), &mut self.debouncer);

        if let Some(code) = path.strip_prefix(EVENT_INDEXES) {
            // "channels[0]=0" for every channel the event is active on
            let active = body.lines().any(|l| {
                l.starts_with("channels[")
                    && l.split('=').nth(1).map(str::trim) == Some(index.to_string().as_str())
            });
            if active {
                if let Some(channel) = code_channel(code) {
                    sink.trigger(channel);
                }
            }
            return sink.finish();
        }

        if body.contains("Code=") {
            for line in body.lines() {
                stream_line(&mut sink, index, line);
            }
            return sink.finish();
        }

        if let Some(on) = extract_kv(body, &motion_enable).and_then(parse_flag) {
            sink.switch(Channel::EnableMotionAlarm, on);
        }
        if let Some(level) = extract_kv(body, &motion_level).and_then(|l| l.parse().ok()) {
            sink.percent(Channel::MotionThreshold, level_to_percent(level, MOTION_LEVEL_MAX));
        }
        if let Some(on) = extract_kv(body, &audio_enable).and_then(parse_flag) {
            sink.switch(Channel::EnableAudioAlarm, on);
        }
        if let Some(threshold) = extract_kv(body, &audio_threshold).and_then(|t| t.parse().ok()) {
            sink.percent(Channel::ThresholdAudioAlarm, threshold);
        }
        if let Some(on) = extract_kv(body, &privacy).and_then(parse_flag) {
            sink.switch(Channel::EnablePrivacyMode, on);
        }
        if let Some(on) = extract_kv(body, &alarm_input).and_then(parse_flag) {
            sink.switch(Channel::EnableExternalAlarmInput, on);
        }

        sink.finish()
    }

    fn command(
        &self,
        channel: Channel,
        value: &ChannelValue,
        _replies: &ReplyStore,
    ) -> Result<CameraRequest> {
        let request = match channel {
            Channel::EnableMotionAlarm => {
                let on = switch_value(value, channel)?;
                CameraRequest::get(self.set_config("MotionDetect", "Enable", on))
                    .refreshing(Self::get_config("MotionDetect"))
            }
            Channel::MotionThreshold => {
                let percent = percent_value(value, channel)?;
                let level = percent_to_level(percent, MOTION_LEVEL_MAX).max(1);
                CameraRequest::get(self.set_config("MotionDetect", "Level", level))
                    .refreshing(Self::get_config("MotionDetect"))
            }
            Channel::EnableAudioAlarm => {
                let on = switch_value(value, channel)?;
                CameraRequest::get(self.set_config("AudioDetect", "MutationDetect", on))
                    .refreshing(Self::get_config("AudioDetect"))
            }
            Channel::ThresholdAudioAlarm => {
                let percent = percent_value(value, channel)?;
                CameraRequest::get(self.set_config("AudioDetect", "MutationThreold", percent))
                    .refreshing(Self::get_config("AudioDetect"))
            }
            Channel::EnablePrivacyMode => {
                let on = switch_value(value, channel)?;
                CameraRequest::get(self.set_config("LeLensMask", "Enable", on))
                    .refreshing(Self::get_config("LeLensMask"))
            }
            Channel::EnableExternalAlarmInput => {
                let on = switch_value(value, channel)?;
                CameraRequest::get(self.set_config("Alarm", "Enable", on))
                    .refreshing(Self::get_config("Alarm"))
            }
            Channel::ExternalLight => {
                let on = switch_value(value, channel)?;
                CameraRequest::get(format!(
                    "/cgi-bin/coaxialControlIO.cgi?action=control&channel={}&info[0].Type=1&info[0].IO={}",
                    self.index() + 1,
                    if on { 1 } else { 2 }
                ))
            }
            other => return Err(unsupported_command(self.brand_id(), other)),
        };
        Ok(request)
    }

    fn debouncer(&mut self) -> &mut AlarmDebouncer {
        &mut self.debouncer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm_debouncer::AlarmState;

    fn ctx(nvr_channel: u32) -> AdapterContext {
        AdapterContext {
            username: "admin".to_string(),
            password: "admin".to_string(),
            nvr_channel,
        }
    }

    const ATTACH: &str = "/cgi-bin/eventManager.cgi?action=attach&codes=[All]";

    #[test]
    fn test_start_stop_latches_without_countdown() {
        let mut a = DahuaAdapter::new(ctx(1), false);
        let out = a.parse(ATTACH, "Content-Type: text/plain\r\nContent-Length:36\r\n\r\nCode=VideoMotion;action=Start;index=0\r\n");
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(a.debouncer.state(Channel::MotionAlarm), AlarmState::Active);

        // Latched alarms survive ticks
        for _ in 0..4 {
            assert!(a.tick().is_empty());
        }

        let out = a.parse(ATTACH, "Code=VideoMotion;action=Stop;index=0");
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(false)));
        assert_eq!(a.debouncer.state(Channel::MotionAlarm), AlarmState::Idle);
    }

    #[test]
    fn test_stream_filters_nvr_index() {
        let mut a = DahuaAdapter::new(ctx(2), false);
        assert!(a.parse(ATTACH, "Code=CrossLineDetection;action=Start;index=0").is_empty());
        let out = a.parse(ATTACH, "Code=CrossLineDetection;action=Start;index=1");
        assert_eq!(out.count_of(Channel::LineCrossingAlarm), 1);
    }

    #[test]
    fn test_heartbeat_and_unknown_codes_ignored() {
        let mut a = DahuaAdapter::new(ctx(1), false);
        assert!(a.parse(ATTACH, "Heartbeat").is_empty());
        assert!(a.parse(ATTACH, "Code=NewFirmwareThing;action=Start;index=0").is_empty());
    }

    #[test]
    fn test_amcrest_polling_counts_down() {
        let mut a = DahuaAdapter::new(ctx(1), true);
        assert_eq!(a.brand(), CameraBrand::Amcrest);
        assert!(a.event_stream().is_none());

        let path = a.high_priority_paths()[0].clone();
        let out = a.parse(&path, "channels[0]=0\r\n");
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(true)));
        assert!(a.parse(&path, "Error\r\nBad Request!\r\n").is_empty());

        assert!(a.tick().is_empty());
        assert!(a.tick().is_empty());
        let off = a.tick();
        assert_eq!(off.len(), 1);
        assert_eq!(off[0].channel, Channel::MotionAlarm);
    }

    #[test]
    fn test_config_reply() {
        let mut a = DahuaAdapter::new(ctx(1), false);
        let body = "table.MotionDetect[0].Enable=true\r\ntable.MotionDetect[0].Level=3\r\n\
                    table.AudioDetect[0].MutationDetect=false\r\ntable.AudioDetect[0].MutationThreold=40\r\n";
        let out = a.parse(&DahuaAdapter::get_config("MotionDetect"), body);
        assert_eq!(out.value_of(Channel::EnableMotionAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.value_of(Channel::MotionThreshold), Some(&ChannelValue::Percent(50)));
        assert_eq!(out.value_of(Channel::EnableAudioAlarm), Some(&ChannelValue::Switch(false)));
        assert_eq!(out.value_of(Channel::ThresholdAudioAlarm), Some(&ChannelValue::Percent(40)));
    }

    #[test]
    fn test_set_config_commands() {
        let a = DahuaAdapter::new(ctx(3), false);
        let req = a
            .command(Channel::EnableMotionAlarm, &ChannelValue::Switch(false), &ReplyStore::new())
            .unwrap();
        assert_eq!(
            req.path,
            "/cgi-bin/configManager.cgi?action=setConfig&MotionDetect[2].Enable=false"
        );
        assert_eq!(
            req.refresh.as_deref(),
            Some("/cgi-bin/configManager.cgi?action=getConfig&name=MotionDetect")
        );
    }
}
