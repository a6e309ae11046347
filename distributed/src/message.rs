use num_enum::TryFromPrimitive;

/// First byte of every payload exchanged by the distributed object system.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// `{u64 object id, object-specific creation parameters}`
    CreateObject = 1,
    /// `{u64 object id}`
    DeleteObject = 2,
    /// `{u64 object id, application-defined payload}` - reserved, accepted and
    ///  ignored by both endpoints
    UpdateObject = 3,
    /// `{u64 object id, string signature, argument tuple}`
    InvokeMethod = 4,
}
