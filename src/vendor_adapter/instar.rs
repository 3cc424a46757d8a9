//! INSTAR adapter
//!
//! Settings come from `param.cgi` scripts (`var m1_enable="1";`). Alarms are
//! pushed by the camera's alarm server to `/instar?&active=N&object=M`; the
//! push carries no stop, so every alarm counts down.

use super::xml::extract_var;
use super::{
    percent_value, switch_value, unsupported_command, CameraBrand, CameraRequest, Channel,
    ChannelValue, EventSink, ParseOutcome, VendorAdapter,
};
use crate::alarm_debouncer::AlarmDebouncer;
use crate::error::Result;
use crate::reply_store::ReplyStore;

const AUDIO_ATTR: &str = "/param.cgi?cmd=getaudioalarmattr";
const MOTION_ATTR: &str = "/cgi-bin/hi3510/param.cgi?cmd=getmdattr";
const IO_ATTR: &str = "/param.cgi?cmd=getioattr";
const SET: &str = "/cgi-bin/hi3510/param.cgi?cmd=";

pub struct InstarAdapter {
    debouncer: AlarmDebouncer,
}

impl Default for InstarAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl InstarAdapter {
    pub fn new() -> Self {
        Self {
            debouncer: AlarmDebouncer::default(),
        }
    }
}

/// Query value from a push URI such as `/instar?&active=6&object=0`
fn query_value<'a>(uri: &'a str, key: &str) -> Option<&'a str> {
    let query = uri.split_once('?')?.1;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

impl VendorAdapter for InstarAdapter {
    fn brand(&self) -> CameraBrand {
        CameraBrand::Instar
    }

    fn snapshot_path(&self) -> Option<String> {
        Some("/tmpfs/snap.jpg".to_string())
    }

    fn mjpeg_path(&self) -> Option<String> {
        Some("/mjpegstream.cgi?-chn=12".to_string())
    }

    fn high_priority_paths(&self) -> Vec<String> {
        Vec::new()
    }

    fn low_priority_paths(&self) -> Vec<String> {
        vec![
            AUDIO_ATTR.to_string(),
            MOTION_ATTR.to_string(),
            IO_ATTR.to_string(),
        ]
    }

    fn parse(&mut self, _path: &str, body: &str) -> ParseOutcome {
        let mut sink = EventSink::new(CameraBrand::Instar, &mut self.debouncer);

        if let Some(v) = extract_var(body, "aa_enable") {
            sink.switch(Channel::EnableAudioAlarm, v == "1");
        }
        if let Some(v) = extract_var(body, "aa_value").and_then(|v| v.parse().ok()) {
            sink.percent(Channel::ThresholdAudioAlarm, v);
        }
        if let Some(v) = extract_var(body, "m1_enable") {
            sink.switch(Channel::EnableMotionAlarm, v == "1");
        }
        if let Some(v) = extract_var(body, "m1_sensitivity").and_then(|v| v.parse().ok()) {
            sink.percent(Channel::MotionThreshold, v);
        }
        if let Some(v) = extract_var(body, "io_enable") {
            sink.switch(Channel::EnableExternalAlarmInput, v == "1");
        }

        sink.finish()
    }

    fn push(&mut self, uri: &str, body: &str) -> ParseOutcome {
        if !uri.starts_with("/instar") {
            return self.parse(uri, body);
        }
        let mut sink = EventSink::new(CameraBrand::Instar, &mut self.debouncer);

        match query_value(uri, "active").and_then(|a| a.parse::<u32>().ok()) {
            Some(1..=4) => sink.trigger(Channel::MotionAlarm),
            Some(5) => sink.trigger(Channel::PirAlarm),
            Some(6) => sink.trigger(Channel::AudioAlarm),
            Some(7) => sink.trigger(Channel::ExternalAlarmInput),
            _ => {}
        }
        match query_value(uri, "object").and_then(|o| o.parse::<u32>().ok()) {
            Some(1) => sink.trigger(Channel::HumanAlarm),
            Some(2) => sink.trigger(Channel::CarAlarm),
            _ => {}
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
                CameraRequest::get(format!("{}setmdattr&-enable={}&-name=1", SET, u8::from(on)))
                    .refreshing(MOTION_ATTR)
            }
            Channel::MotionThreshold => {
                let percent = percent_value(value, channel)?;
                CameraRequest::get(format!("{}setmdattr&-s={}&-name=1", SET, percent))
                    .refreshing(MOTION_ATTR)
            }
            Channel::EnableAudioAlarm => {
                let on = switch_value(value, channel)?;
                CameraRequest::get(format!("{}setaudioalarmattr&-aa_enable={}", SET, u8::from(on)))
                    .refreshing(AUDIO_ATTR)
            }
            Channel::ThresholdAudioAlarm => {
                let percent = percent_value(value, channel)?;
                let cmd = if percent == 0 {
                    format!("{}setaudioalarmattr&-aa_enable=0", SET)
                } else {
                    format!("{}setaudioalarmattr&-aa_enable=1&-aa_value={}", SET, percent)
                };
                CameraRequest::get(cmd).refreshing(AUDIO_ATTR)
            }
            Channel::EnableExternalAlarmInput => {
                let on = switch_value(value, channel)?;
                CameraRequest::get(format!("{}setioattr&-io_enable={}", SET, u8::from(on)))
                    .refreshing(IO_ATTR)
            }
            other => return Err(unsupported_command(CameraBrand::Instar, other)),
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

    #[test]
    fn test_param_script() {
        let mut a = InstarAdapter::new();
        let body = "var aa_enable=\"1\";\r\nvar aa_value=\"65\";\r\n";
        let out = a.parse(AUDIO_ATTR, body);
        assert_eq!(out.value_of(Channel::EnableAudioAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.value_of(Channel::ThresholdAudioAlarm), Some(&ChannelValue::Percent(65)));
    }

    #[test]
    fn test_alarm_server_push() {
        let mut a = InstarAdapter::new();
        let out = a.push("/instar?&active=6&object=0", "");
        assert_eq!(out.value_of(Channel::AudioAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.value_of(Channel::MotionAlarm), None);

        let out = a.push("/instar?&active=2&object=1", "");
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.value_of(Channel::HumanAlarm), Some(&ChannelValue::Switch(true)));

        // Unknown codes are no-ops
        assert!(a.push("/instar?&active=42", "").is_empty());
    }

    #[test]
    fn test_pushed_alarm_counts_down() {
        let mut a = InstarAdapter::new();
        a.push("/instar?&active=5", "");
        assert!(a.tick().is_empty());
        a.push("/instar?&active=5", "");
        assert!(a.tick().is_empty());
        assert!(a.tick().is_empty());
        assert_eq!(a.tick().len(), 1);
    }

    #[test]
    fn test_audio_threshold_zero_disables() {
        let a = InstarAdapter::new();
        let req = a
            .command(Channel::ThresholdAudioAlarm, &ChannelValue::Percent(0), &ReplyStore::new())
            .unwrap();
        assert_eq!(req.path, "/cgi-bin/hi3510/param.cgi?cmd=setaudioalarmattr&-aa_enable=0");
        assert_eq!(req.refresh.as_deref(), Some(AUDIO_ATTR));
    }
}
