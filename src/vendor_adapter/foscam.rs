//! Foscam CGIProxy adapter
//!
//! `getDevState` encodes both the enable switch and the alarm level in one
//! value (0 disabled, 1 enabled/idle, 2 alarming), so nothing here counts
//! down: the camera holds the state itself.

use super::xml::extract_tag;
use super::{
    level_to_percent, percent_to_level, percent_value, switch_value, unsupported_command,
    AdapterContext, CameraBrand, CameraRequest, Channel, ChannelValue, EventSink, ParseOutcome,
    VendorAdapter,
};
use crate::alarm_debouncer::AlarmDebouncer;
use crate::error::Result;
use crate::reply_store::ReplyStore;

/// Highest Foscam audio sensitivity level (0 low, 1 medium, 2 high)
const AUDIO_SENSITIVITY_MAX: u32 = 2;

pub struct FoscamAdapter {
    ctx: AdapterContext,
    debouncer: AlarmDebouncer,
}

impl FoscamAdapter {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            ctx,
            debouncer: AlarmDebouncer::default(),
        }
    }

    /// Foscam takes credentials in the query string
    fn cgi(&self, cmd: &str) -> String {
        format!(
            "/cgi-bin/CGIProxy.fcgi?cmd={}&usr={}&pwd={}",
            cmd,
            urlencoding::encode(&self.ctx.username),
            urlencoding::encode(&self.ctx.password)
        )
    }

    fn level_state(sink: &mut EventSink<'_>, code: &str, enable: Channel, alarm: Channel) {
        match code {
            "0" => sink.switch(enable, false),
            "1" => {
                sink.switch(enable, true);
                sink.clear(alarm);
            }
            "2" => {
                sink.switch(enable, true);
                sink.latch(alarm);
            }
            _ => {}
        }
    }
}

impl VendorAdapter for FoscamAdapter {
    fn brand(&self) -> CameraBrand {
        CameraBrand::Foscam
    }

    fn snapshot_path(&self) -> Option<String> {
        Some(self.cgi("snapPicture2"))
    }

    fn mjpeg_path(&self) -> Option<String> {
        Some(format!(
            "/cgi-bin/CGIStream.cgi?cmd=GetMJStream&usr={}&pwd={}",
            urlencoding::encode(&self.ctx.username),
            urlencoding::encode(&self.ctx.password)
        ))
    }

    fn high_priority_paths(&self) -> Vec<String> {
        vec![self.cgi("getDevState")]
    }

    fn low_priority_paths(&self) -> Vec<String> {
        vec![
            self.cgi("getMotionDetectConfig"),
            self.cgi("getAudioAlarmConfig"),
        ]
    }

    fn parse(&mut self, path: &str, body: &str) -> ParseOutcome {
        let mut sink = EventSink::new(CameraBrand::Foscam, &mut self.debouncer);

        if let Some(code) = extract_tag(body, "motionDetectAlarm") {
            Self::level_state(&mut sink, code, Channel::EnableMotionAlarm, Channel::MotionAlarm);
        }
        if let Some(code) = extract_tag(body, "soundAlarm") {
            Self::level_state(&mut sink, code, Channel::EnableAudioAlarm, Channel::AudioAlarm);
        }

        if let Some(enabled) = extract_tag(body, "isEnable") {
            let on = enabled == "1";
            if path.contains("getMotionDetectConfig") {
                sink.switch(Channel::EnableMotionAlarm, on);
            } else if path.contains("getAudioAlarmConfig") {
                sink.switch(Channel::EnableAudioAlarm, on);
                if let Some(level) = extract_tag(body, "sensitivity").and_then(|s| s.parse().ok()) {
                    sink.percent(
                        Channel::ThresholdAudioAlarm,
                        level_to_percent(level, AUDIO_SENSITIVITY_MAX),
                    );
                }
            }
        }

        sink.finish()
    }

    fn command(
        &self,
        channel: Channel,
        value: &ChannelValue,
        _replies: &ReplyStore,
    ) -> Result<CameraRequest> {
        match channel {
            Channel::EnableMotionAlarm => {
                let on = switch_value(value, channel)?;
                Ok(CameraRequest::get(self.cgi(&format!(
                    "setMotionDetectConfig&isEnable={}",
                    u8::from(on)
                )))
                .refreshing(self.cgi("getMotionDetectConfig")))
            }
            Channel::EnableAudioAlarm => {
                let on = switch_value(value, channel)?;
                Ok(CameraRequest::get(self.cgi(&format!(
                    "setAudioAlarmConfig&isEnable={}",
                    u8::from(on)
                )))
                .refreshing(self.cgi("getAudioAlarmConfig")))
            }
            Channel::ThresholdAudioAlarm => {
                let percent = percent_value(value, channel)?;
                let cmd = if percent == 0 {
                    "setAudioAlarmConfig&isEnable=0".to_string()
                } else {
                    format!(
                        "setAudioAlarmConfig&isEnable=1&sensitivity={}",
                        percent_to_level(percent, AUDIO_SENSITIVITY_MAX)
                    )
                };
                Ok(CameraRequest::get(self.cgi(&cmd)).refreshing(self.cgi("getAudioAlarmConfig")))
            }
            other => Err(unsupported_command(CameraBrand::Foscam, other)),
        }
    }

    fn debouncer(&mut self) -> &mut AlarmDebouncer {
        &mut self.debouncer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> FoscamAdapter {
        FoscamAdapter::new(AdapterContext {
            username: "admin".to_string(),
            password: "p&ss".to_string(),
            nvr_channel: 1,
        })
    }

    fn dev_state(a: &mut FoscamAdapter, body: &str) -> ParseOutcome {
        let path = a.high_priority_paths()[0].clone();
        a.parse(&path, body)
    }

    #[test]
    fn test_motion_level_zero_disables() {
        let mut a = adapter();
        let out = dev_state(&mut a, "<CGI_Result><result>0</result><motionDetectAlarm>0</motionDetectAlarm></CGI_Result>");
        assert_eq!(out.value_of(Channel::EnableMotionAlarm), Some(&ChannelValue::Switch(false)));
        assert_eq!(out.value_of(Channel::MotionAlarm), None);
    }

    #[test]
    fn test_motion_level_one_enabled_idle() {
        let mut a = adapter();
        let out = dev_state(&mut a, "<motionDetectAlarm>1</motionDetectAlarm>");
        assert_eq!(out.value_of(Channel::EnableMotionAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(false)));
    }

    #[test]
    fn test_motion_level_two_alarming() {
        let mut a = adapter();
        let out = dev_state(&mut a, "<motionDetectAlarm>2</motionDetectAlarm>");
        assert_eq!(out.value_of(Channel::EnableMotionAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(true)));

        // Held by the camera, not by a countdown
        for _ in 0..5 {
            assert!(a.tick().is_empty());
        }
    }

    #[test]
    fn test_sound_alarm_levels() {
        let mut a = adapter();
        let out = dev_state(&mut a, "<soundAlarm>2</soundAlarm>");
        assert_eq!(out.value_of(Channel::AudioAlarm), Some(&ChannelValue::Switch(true)));
        let out = dev_state(&mut a, "<soundAlarm>1</soundAlarm>");
        assert_eq!(out.value_of(Channel::AudioAlarm), Some(&ChannelValue::Switch(false)));
    }

    #[test]
    fn test_audio_config_reply() {
        let mut a = adapter();
        let path = a.low_priority_paths()[1].clone();
        let out = a.parse(&path, "<isEnable>1</isEnable><sensitivity>1</sensitivity>");
        assert_eq!(out.value_of(Channel::EnableAudioAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.value_of(Channel::ThresholdAudioAlarm), Some(&ChannelValue::Percent(50)));
    }

    #[test]
    fn test_heartbeat_is_ignored() {
        let mut a = adapter();
        assert!(dev_state(&mut a, "<CGI_Result><result>0</result></CGI_Result>").is_empty());
    }

    #[test]
    fn test_commands_encode_credentials() {
        let a = adapter();
        let req = a
            .command(Channel::EnableMotionAlarm, &ChannelValue::Switch(true), &ReplyStore::new())
            .unwrap();
        assert_eq!(
            req.path,
            "/cgi-bin/CGIProxy.fcgi?cmd=setMotionDetectConfig&isEnable=1&usr=admin&pwd=p%26ss"
        );
        assert!(a
            .command(Channel::Doorbell, &ChannelValue::Switch(true), &ReplyStore::new())
            .is_err());
    }
}
