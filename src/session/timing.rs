//! Half-duplex timing model.
//!
//! A shared channel with PTT turnaround cannot be driven write-after-write:
//! each transmission must finish leaving the radio before the next action.
//! The sender sleeps for the estimated on-air time of every frame plus a
//! per-type tail, all derived from the configured baud rate and the single
//! stabilization constant.

use crate::config::ProtocolConfig;
use crate::types::MessageType;
use std::time::Duration;

/// Estimated on-air time for a frame: 10 bits per byte (8 data + start +
/// stop) at the configured rate, plus the fixed per-frame send delay.
pub fn estimate_transmission_time(cfg: &ProtocolConfig, frame_len: usize) -> Duration {
    let bits = (frame_len as f64) * 10.0;
    let seconds = bits / f64::from(cfg.baud_rate.max(1));
    Duration::from_secs_f64(seconds + cfg.packet_send_delay)
}

/// Tail pause appended after a frame has gone out, sized by message type:
/// short for ACKs, longer for connection control, standard for data.
pub fn post_send_tail(cfg: &ProtocolConfig, ty: MessageType) -> Duration {
    let secs = match ty {
        MessageType::Ack => cfg.ptt_tail,
        MessageType::Connect | MessageType::ConnectAck | MessageType::Ready => cfg.ptt_ack_spacing,
        _ => cfg.ptt_rx_delay,
    };
    Duration::from_secs_f64(secs)
}

/// Total post-send pause for a frame of the given length and type.
pub fn send_pause(cfg: &ProtocolConfig, frame_len: usize, ty: MessageType) -> Duration {
    estimate_transmission_time(cfg, frame_len) + post_send_tail(cfg, ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ProtocolConfig {
        ProtocolConfig {
            baud_rate: 1200,
            packet_send_delay: 0.5,
            ptt_tail: 0.1,
            ptt_ack_spacing: 0.5,
            ptt_rx_delay: 0.25,
            ..ProtocolConfig::default()
        }
    }

    #[test]
    fn transmission_time_scales_with_length() {
        let cfg = cfg();
        // 120 bytes = 1200 bits = 1 second at 1200 baud, plus the delay.
        let t = estimate_transmission_time(&cfg, 120);
        assert!((t.as_secs_f64() - 1.5).abs() < 1e-9);

        let longer = estimate_transmission_time(&cfg, 240);
        assert!(longer > t);
    }

    #[test]
    fn tails_ordered_by_type() {
        let cfg = cfg();
        let ack = post_send_tail(&cfg, MessageType::Ack);
        let data = post_send_tail(&cfg, MessageType::Response);
        let control = post_send_tail(&cfg, MessageType::Connect);
        assert!(ack < data);
        assert!(data < control);
    }
}
