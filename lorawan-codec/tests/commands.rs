use heapless::Vec;
use lorawan_codec::commands::*;

#[test]
fn parse_link_adr_then_dev_status() {
    let data = [0x03, 0x52, 0xff, 0x00, 0x01, 0x06];
    let cmds: std::vec::Vec<DownlinkCommand> = parse_downlink_commands(&data).collect();
    assert_eq!(
        cmds,
        [
            DownlinkCommand::LinkAdrReq {
                data_rate: 5,
                tx_power: 2,
                channel_mask: 0x00ff,
                ch_mask_cntl: 0,
                nb_trans: 1,
            },
            DownlinkCommand::DevStatusReq,
        ]
    );
}

#[test]
fn parse_stops_at_unknown_cid() {
    // RxTimingSetupReq, unknown CID 0x60, then a DevStatusReq that is lost
    let data = [0x08, 0x02, 0x60, 0x06];
    let cmds: std::vec::Vec<DownlinkCommand> = parse_downlink_commands(&data).collect();
    assert_eq!(cmds, [DownlinkCommand::RxTimingSetupReq { delay: 2 }]);
}

#[test]
fn parse_stops_at_truncated_command() {
    // LinkAdrReq needs 4 payload bytes, only 2 present
    let data = [0x03, 0x52, 0xff];
    assert_eq!(parse_downlink_commands(&data).count(), 0);
}

#[test]
fn parse_link_check_ans() {
    let data = [0x02, 0x07, 0x01];
    let cmds: std::vec::Vec<DownlinkCommand> = parse_downlink_commands(&data).collect();
    assert_eq!(cmds, [DownlinkCommand::LinkCheckAns { margin: 7, gateway_count: 1 }]);
}

#[test]
fn parse_duty_cycle_req() {
    let data = [0x04, 0x05];
    let cmds: std::vec::Vec<DownlinkCommand> = parse_downlink_commands(&data).collect();
    assert_eq!(cmds, [DownlinkCommand::DutyCycleReq { max_duty_cycle: 5 }]);
}

#[test]
fn parse_rx_param_setup_req() {
    // offset 2, RX2 DR3, 869.525 MHz (8695250 * 100 Hz, little-endian)
    let data = [0x05, 0x23, 0xd2, 0xad, 0x84];
    let cmds: std::vec::Vec<DownlinkCommand> = parse_downlink_commands(&data).collect();
    assert_eq!(
        cmds,
        [DownlinkCommand::RxParamSetupReq {
            rx1_dr_offset: 2,
            rx2_data_rate: 3,
            frequency_hz: 869_525_000,
        }]
    );
}

#[test]
fn parse_new_channel_req() {
    // channel 3 at 868.1 MHz (8681000 * 100 Hz), DR0..=5
    let data = [0x07, 0x03, 0x28, 0x76, 0x84, 0x50];
    let cmds: std::vec::Vec<DownlinkCommand> = parse_downlink_commands(&data).collect();
    assert_eq!(
        cmds,
        [DownlinkCommand::NewChannelReq {
            channel_index: 3,
            frequency_hz: 868_100_000,
            min_data_rate: 0,
            max_data_rate: 5,
        }]
    );
}

#[test]
fn encode_link_adr_ans() {
    let mut out: Vec<u8, 15> = Vec::new();
    let all = UplinkCommand::LinkAdrAns {
        channel_mask_ack: true,
        data_rate_ack: true,
        power_ack: true,
    };
    assert!(all.encode_into(&mut out));
    assert_eq!(&out[..], &[0x03, 0x07]);

    out.clear();
    let partial = UplinkCommand::LinkAdrAns {
        channel_mask_ack: true,
        data_rate_ack: true,
        power_ack: false,
    };
    assert!(partial.encode_into(&mut out));
    assert_eq!(&out[..], &[0x03, 0x03]);
}

#[test]
fn encode_rx_param_setup_ans() {
    let mut out: Vec<u8, 15> = Vec::new();
    let ans = UplinkCommand::RxParamSetupAns {
        channel_ack: true,
        rx2_data_rate_ack: false,
        rx1_dr_offset_ack: true,
    };
    assert!(ans.encode_into(&mut out));
    assert_eq!(&out[..], &[0x05, 0x05]);
}

#[test]
fn encode_dev_status_ans_clamps_margin() {
    let mut out: Vec<u8, 15> = Vec::new();
    assert!(UplinkCommand::DevStatusAns { battery: 254, margin: -18 }.encode_into(&mut out));
    assert_eq!(&out[..], &[0x06, 0xfe, 0x2e]);

    out.clear();
    assert!(UplinkCommand::DevStatusAns { battery: 1, margin: 100 }.encode_into(&mut out));
    assert_eq!(out[2], 31);
}

#[test]
fn encode_zero_length_answers() {
    let mut out: Vec<u8, 15> = Vec::new();
    assert!(UplinkCommand::LinkCheckReq.encode_into(&mut out));
    assert!(UplinkCommand::DutyCycleAns.encode_into(&mut out));
    assert!(UplinkCommand::RxTimingSetupAns.encode_into(&mut out));
    assert_eq!(&out[..], &[0x02, 0x04, 0x08]);
}

#[test]
fn encode_into_respects_the_buffer_bound() {
    let mut out: Vec<u8, 15> = Vec::new();
    let ans = UplinkCommand::DevStatusAns { battery: 10, margin: 0 };
    for _ in 0..5 {
        assert!(ans.encode_into(&mut out));
    }
    assert_eq!(out.len(), 15);
    // a sixth answer no longer fits and the buffer stays intact
    assert!(!ans.encode_into(&mut out));
    assert_eq!(out.len(), 15);
}

#[test]
fn answer_lengths_match_their_encodings() {
    let answers = [
        UplinkCommand::LinkCheckReq,
        UplinkCommand::LinkAdrAns { channel_mask_ack: false, data_rate_ack: false, power_ack: false },
        UplinkCommand::DutyCycleAns,
        UplinkCommand::RxParamSetupAns {
            channel_ack: false,
            rx2_data_rate_ack: false,
            rx1_dr_offset_ack: false,
        },
        UplinkCommand::DevStatusAns { battery: 0, margin: 0 },
        UplinkCommand::NewChannelAns { channel_freq_ack: true, data_rate_range_ack: true },
        UplinkCommand::RxTimingSetupAns,
    ];
    for ans in answers {
        let mut out: Vec<u8, 15> = Vec::new();
        assert!(ans.encode_into(&mut out));
        assert_eq!(out.len(), ans.encoded_len());
        assert_eq!(out[0], ans.cid());
    }
}
