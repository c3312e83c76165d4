use displaydoc::Display;

/// All thread slots of the [Domain](crate::Domain) are already attached.
#[derive(Debug, Display, Eq, PartialEq)]
pub struct AttachError;

#[cfg(feature = "std")]
impl std::error::Error for AttachError {}
