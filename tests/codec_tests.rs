use elixys_hal::*;
use std::sync::Arc;

fn default_codec() -> Codec {
    let config = SystemConfig::bundled().unwrap();
    Codec::new(build_schema(&config).unwrap())
}

fn codec_for(json: &str) -> Codec {
    let config = SystemConfig::from_json_str(json).unwrap();
    Codec::new(build_schema(&config).unwrap())
}

// Distinct, in-range value for field `i`
fn sample(code: FormatCode, i: usize) -> Value {
    let n = (i % 100) as u8 + 1;
    match code {
        FormatCode::Char => Value::Char(n),
        FormatCode::I8 => Value::I8(-(n as i8 % 100)),
        FormatCode::U8 => Value::U8(n),
        FormatCode::Bool => Value::Bool(i % 2 == 0),
        FormatCode::I16 => Value::I16(-(n as i16) * 100),
        FormatCode::U16 => Value::U16(n as u16 * 300),
        FormatCode::I32 | FormatCode::Long => Value::I32(-(n as i32) * 70_000),
        FormatCode::U32 | FormatCode::ULong => Value::U32(n as u32 * 70_000),
        FormatCode::I64 => Value::I64(-(n as i64) << 40),
        FormatCode::U64 => Value::U64((n as u64) << 40),
        FormatCode::F32 => Value::F32(n as f32 * 1.25),
        FormatCode::F64 => Value::F64(n as f64 * -2.5),
        FormatCode::Bytes(len) => Value::Bytes(vec![n; len]),
    }
}

#[test]
fn test_scenario_mixer_frame_is_25_bytes() {
    let codec = codec_for(
        r#"{"subsystems":[{"name":"Mixers","count":3,"message_format":{
            "fields":[["error_code","c"]],
            "repeat":[["period","i"],["duty_cycle","f"]]}}]}"#,
    );
    assert_eq!(codec.frame_len(), 1 + 3 * (4 + 4));

    let snapshot = codec.decode_snapshot(&[0u8; 25]).unwrap();
    assert_eq!(snapshot.get("Mixers", "error_code"), Some(&Value::Char(0)));
    for unit in 0..3 {
        assert_eq!(snapshot.get_unit("Mixers", unit, "period"), Some(&Value::I32(0)));
        assert_eq!(snapshot.get_unit("Mixers", unit, "duty_cycle"), Some(&Value::F32(0.0)));
    }
    assert_eq!(snapshot.get_unit("Mixers", 3, "period"), None);
}

#[test]
fn test_default_layout_round_trip() {
    let codec = default_codec();
    let values: Vec<Value> = codec
        .codes()
        .iter()
        .enumerate()
        .map(|(i, code)| sample(*code, i))
        .collect();

    let frame = codec.encode(&values).unwrap();
    assert_eq!(frame.len(), codec.frame_len());
    assert_eq!(codec.decode(&frame).unwrap(), values);
}

#[test]
fn test_decode_is_idempotent() {
    let codec = default_codec();
    let frame: Vec<u8> = (0..codec.frame_len()).map(|i| (i % 50) as u8).collect();

    let first = codec.decode_snapshot(&frame).unwrap();
    let second = codec.decode_snapshot(&frame).unwrap();
    assert_eq!(first, second);
    assert_eq!(codec.encode_snapshot(&first).unwrap(), frame);
}

#[test]
fn test_field_order_scalars_then_units() {
    let codec = codec_for(
        r#"{"subsystems":[
            {"name":"Header","message_format":{"fields":[["packet_type","i"]]}},
            {"name":"Probes","count":2,"message_format":{
                "fields":[["error_code","c"]],
                "repeat":[["temperature","f"],["error_code","c"]]}}
        ]}"#,
    );
    assert_eq!(codec.format_string(), "<icfcfc");

    let mut frame = Vec::new();
    frame.extend_from_slice(&63i32.to_le_bytes());
    frame.push(9);
    frame.extend_from_slice(&25.0f32.to_le_bytes());
    frame.push(1);
    frame.extend_from_slice(&30.5f32.to_le_bytes());
    frame.push(2);

    let snapshot = codec.decode_snapshot(&frame).unwrap();
    assert_eq!(snapshot.get("Header", "packet_type"), Some(&Value::I32(63)));
    assert_eq!(snapshot.get("Probes", "error_code"), Some(&Value::Char(9)));
    assert_eq!(snapshot.get_unit("Probes", 0, "temperature"), Some(&Value::F32(25.0)));
    assert_eq!(snapshot.get_unit("Probes", 0, "error_code"), Some(&Value::Char(1)));
    assert_eq!(snapshot.get_unit("Probes", 1, "temperature"), Some(&Value::F32(30.5)));
    assert_eq!(snapshot.get_unit("Probes", 1, "error_code"), Some(&Value::Char(2)));
}

#[test]
fn test_zero_unit_subsystem_has_only_scalars() {
    let codec = codec_for(
        r#"{"subsystems":[
            {"name":"Valves","message_format":{"fields":[["state","3H"]]}},
            {"name":"Idle","count":0,"message_format":{"repeat":[["x","i"]]}}
        ]}"#,
    );
    assert_eq!(codec.frame_len(), 6);

    let snapshot = codec
        .decode_snapshot(&[0x01, 0x00, 0x02, 0x00, 0x03, 0x00])
        .unwrap();
    assert_eq!(snapshot.get("Valves", "state"), Some(&Value::U16(1)));
    assert_eq!(snapshot.get("Valves", "state_1"), Some(&Value::U16(2)));
    assert_eq!(snapshot.get("Valves", "state_2"), Some(&Value::U16(3)));
    assert_eq!(snapshot.subsystem("Idle").unwrap().units.len(), 0);
}

#[test]
fn test_encode_rejects_wrong_types() {
    let codec = default_codec();
    let mut values: Vec<Value> = codec.codes().iter().map(|c| c.zero()).collect();
    values[0] = Value::F32(1.0);
    assert!(matches!(codec.encode(&values), Err(HalError::Format(_))));
}

#[test]
fn test_layout_covers_frame_without_gaps() {
    let codec = default_codec();
    let mut expected = 0;
    for field in codec.layout() {
        assert_eq!(field.offset, expected, "gap before {}.{}", field.subsystem, field.name);
        assert_eq!(field.c_type, field.code.c_type_name());
        expected += field.code.size();
    }
    assert_eq!(expected, codec.frame_len());
}

#[test]
fn test_snapshots_share_schema() {
    let codec = default_codec();
    let snapshot = codec.decode_snapshot(&vec![0u8; codec.frame_len()]).unwrap();
    assert!(Arc::ptr_eq(snapshot.schema(), codec.schema()));
}
