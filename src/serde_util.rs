use serde::{ser, Serializer};

pub(crate) fn serialize_u64_as_i64<S: Serializer>(
    val: &u64,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match i64::try_from(*val) {
        Ok(val) => serializer.serialize_i64(val),
        Err(_) => Err(ser::Error::custom("u64 specified does not fit into an i64")),
    }
}

pub(crate) fn serialize_u32_as_i32<S: Serializer>(
    val: &u32,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match i32::try_from(*val) {
        Ok(val) => serializer.serialize_i32(val),
        Err(_) => Err(ser::Error::custom("u32 specified does not fit into an i32")),
    }
}
