//! DoorBird adapter
//!
//! `monitor.cgi` streams `doorbell:H` / `doorbell:L` style level changes,
//! so both the doorbell and the motion sensor latch and clear explicitly.

use super::{
    switch_value, unsupported_command, CameraBrand, CameraRequest, Channel, ChannelValue,
    EventSink, EventStream, ParseOutcome, VendorAdapter,
};
use crate::alarm_debouncer::AlarmDebouncer;
use crate::error::Result;
use crate::reply_store::ReplyStore;

pub struct DoorBirdAdapter {
    debouncer: AlarmDebouncer,
}

impl Default for DoorBirdAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DoorBirdAdapter {
    pub fn new() -> Self {
        Self {
            debouncer: AlarmDebouncer::default(),
        }
    }
}

impl VendorAdapter for DoorBirdAdapter {
    fn brand(&self) -> CameraBrand {
        CameraBrand::Doorbird
    }

    fn snapshot_path(&self) -> Option<String> {
        Some("/bha-api/image.cgi".to_string())
    }

    fn mjpeg_path(&self) -> Option<String> {
        Some("/bha-api/video.cgi".to_string())
    }

    fn high_priority_paths(&self) -> Vec<String> {
        Vec::new()
    }

    fn low_priority_paths(&self) -> Vec<String> {
        Vec::new()
    }

    fn event_stream(&self) -> Option<EventStream> {
        Some(EventStream {
            path: "/bha-api/monitor.cgi?ring=doorbell,motionsensor".to_string(),
            delimiter: "--ioboundary",
        })
    }

    fn parse(&mut self, _path: &str, body: &str) -> ParseOutcome {
        let mut sink = EventSink::new(CameraBrand::Doorbird, &mut self.debouncer);

        for line in body.lines().map(str::trim) {
            let channel = if line.starts_with("doorbell:") {
                Channel::Doorbell
            } else if line.starts_with("motionsensor:") {
                Channel::MotionAlarm
            } else {
                continue;
            };
            match line.rsplit(':').next() {
                Some("H") => sink.latch(channel),
                Some("L") => sink.clear(channel),
                _ => {}
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
            Channel::ExternalLight => {
                // Light turns itself off; OFF has nothing to send
                if switch_value(value, channel)? {
                    Ok(CameraRequest::get("/bha-api/light-on.cgi"))
                } else {
                    Err(crate::error::Error::Validation(
                        "DoorBird light only accepts ON".to_string(),
                    ))
                }
            }
            Channel::DoorRelay => {
                if switch_value(value, channel)? {
                    Ok(CameraRequest::get("/bha-api/open-door.cgi"))
                } else {
                    Err(crate::error::Error::Validation(
                        "DoorBird relay only accepts ON".to_string(),
                    ))
                }
            }
            other => Err(unsupported_command(CameraBrand::Doorbird, other)),
        }
    }

    fn debouncer(&mut self) -> &mut AlarmDebouncer {
        &mut self.debouncer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_levels() {
        let mut a = DoorBirdAdapter::new();
        let path = a.event_stream().unwrap().path;

        let out = a.parse(&path, "Content-Type: text/plain\r\n\r\ndoorbell:H\r\n");
        assert_eq!(out.value_of(Channel::Doorbell), Some(&ChannelValue::Switch(true)));
        assert!(out.events[0].fresh);

        let out = a.parse(&path, "doorbell:L\r\nmotionsensor:H\r\n");
        assert_eq!(out.value_of(Channel::Doorbell), Some(&ChannelValue::Switch(false)));
        assert_eq!(out.value_of(Channel::MotionAlarm), Some(&ChannelValue::Switch(true)));
        assert!(a.tick().is_empty());
    }

    #[test]
    fn test_relay_and_light() {
        let a = DoorBirdAdapter::new();
        let store = ReplyStore::new();
        let req = a.command(Channel::DoorRelay, &ChannelValue::Switch(true), &store).unwrap();
        assert_eq!(req.path, "/bha-api/open-door.cgi");
        assert!(a.command(Channel::ExternalLight, &ChannelValue::Switch(false), &store).is_err());
        assert!(a.command(Channel::MotionThreshold, &ChannelValue::Percent(3), &store).is_err());
    }
}
