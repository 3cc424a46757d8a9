//! Generic ONVIF event adapter
//!
//! Parses `wsnt:NotificationMessage` blocks from PullMessages responses or
//! camera-initiated `/OnvifEvent` posts. Snapshot and stream URIs come from
//! discovery, so this adapter names no paths of its own.

use super::xml::{attribute_in, extract_blocks, extract_tag, parse_flag};
use super::{
    unsupported_command, CameraBrand, CameraRequest, Channel, ChannelValue, EventSink,
    ParseOutcome, VendorAdapter,
};
use crate::alarm_debouncer::AlarmDebouncer;
use crate::error::Result;
use crate::reply_store::ReplyStore;

/// Topic suffix to channel. Line crossings carry no state and count down.
const TOPICS: &[(&str, Channel)] = &[
    ("CellMotionDetector/Motion", Channel::MotionAlarm),
    ("VideoSource/MotionAlarm", Channel::MotionAlarm),
    ("AudioAnalytics/Audio/DetectedSound", Channel::AudioAlarm),
    ("FieldDetector/ObjectsInside", Channel::FieldDetectionAlarm),
    ("LineDetector/Crossed", Channel::LineCrossingAlarm),
    ("TamperDetector/Tamper", Channel::TamperAlarm),
    ("VideoSource/GlobalSceneChange", Channel::TamperAlarm),
    ("Device/Trigger/DigitalInput", Channel::ExternalAlarmInput),
    ("MyRuleDetector/PeopleDetect", Channel::HumanAlarm),
    ("MyRuleDetector/VehicleDetect", Channel::CarAlarm),
    ("MyRuleDetector/FaceDetect", Channel::FaceDetected),
    ("MyRuleDetector/Visitor", Channel::Doorbell),
];

pub struct OnvifAdapter {
    debouncer: AlarmDebouncer,
}

impl Default for OnvifAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OnvifAdapter {
    pub fn new() -> Self {
        Self {
            debouncer: AlarmDebouncer::default(),
        }
    }
}

/// First boolean `Value` among the `SimpleItem`s of a message's `Data`
fn data_state(message: &str) -> Option<bool> {
    let data = extract_blocks(message, "Data").into_iter().next().unwrap_or(message);
    data.split("SimpleItem")
        .skip(1)
        .filter_map(|fragment| fragment.split('>').next())
        .filter_map(|start_tag| attribute_in(start_tag, "Value"))
        .find_map(parse_flag)
}

impl VendorAdapter for OnvifAdapter {
    fn brand(&self) -> CameraBrand {
        CameraBrand::Onvif
    }

    fn snapshot_path(&self) -> Option<String> {
        None
    }

    fn high_priority_paths(&self) -> Vec<String> {
        Vec::new()
    }

    fn low_priority_paths(&self) -> Vec<String> {
        Vec::new()
    }

    fn parse(&mut self, _path: &str, body: &str) -> ParseOutcome {
        let mut sink = EventSink::new(CameraBrand::Onvif, &mut self.debouncer);

        for message in extract_blocks(body, "NotificationMessage") {
            let Some(topic) = extract_tag(message, "Topic") else {
                continue;
            };
            let Some(&(_, channel)) = TOPICS.iter().find(|(suffix, _)| topic.ends_with(suffix))
            else {
                continue;
            };
            if channel == Channel::LineCrossingAlarm {
                sink.trigger(channel);
                continue;
            }
            match data_state(message) {
                Some(true) => sink.latch(channel),
                Some(false) => sink.clear(channel),
                None => {}
            }
        }

        sink.finish()
    }

    fn command(
        &self,
        channel: Channel,
        _value: &ChannelValue,
        _replies: &ReplyStore,
    ) -> Result<CameraRequest> {
        Err(unsupported_command(CameraBrand::Onvif, channel))
    }

    fn debouncer(&mut self) -> &mut AlarmDebouncer {
        &mut self.debouncer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, name: &str, value: &str) -> String {
        format!(
            r#"<wsnt:NotificationMessage>
<wsnt:Topic Dialect="http://www.onvif.org/ver10/tev/topicExpression/ConcreteSet">{}</wsnt:Topic>
<wsnt:Message><tt:Message UtcTime="2024-05-01T10:00:00Z" PropertyOperation="Changed">
<tt:Source><tt:SimpleItem Name="VideoSourceConfigurationToken" Value="VideoSourceToken"/></tt:Source>
<tt:Data><tt:SimpleItem Name="{}" Value="{}"/></tt:Data>
</tt:Message></wsnt:Message>
</wsnt:NotificationMessage>"#,
            topic, name, value
        )
    }

    #[test]
    fn test_cell_motion_latches_and_clears() {
        let mut a = OnvifAdapter::new();
        let body = message("tns1:RuleEngine/CellMotionDetector/Motion", "IsMotion", "true");
        let out = a.parse("/OnvifEvent", &body);
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(true)));
        assert!(a.tick().is_empty());

        let body = message("tns1:RuleEngine/CellMotionDetector/Motion", "IsMotion", "false");
        let out = a.parse("/OnvifEvent", &body);
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(false)));
    }

    #[test]
    fn test_multiple_messages_in_one_pull() {
        let mut a = OnvifAdapter::new();
        let body = format!(
            "<tev:PullMessagesResponse>{}{}</tev:PullMessagesResponse>",
            message("tns1:Device/Trigger/DigitalInput", "LogicalState", "true"),
            message("tns1:RuleEngine/LineDetector/Crossed", "ObjectId", "7"),
        );
        let out = a.parse("", &body);
        assert_eq!(out.value_of(Channel::ExternalAlarmInput), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.value_of(Channel::LineCrossingAlarm), Some(&ChannelValue::Switch(true)));
        assert_eq!(out.events.iter().find(|e| e.channel == Channel::LineCrossingAlarm).map(|e| e.ttl), Some(3));
    }

    #[test]
    fn test_unknown_topic_is_noop() {
        let mut a = OnvifAdapter::new();
        let body = message("tns1:Monitoring/ProcessorUsage", "Value", "0.4");
        assert!(a.parse("", &body).is_empty());
    }
}
