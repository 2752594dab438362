//! Opaque identifiers carried through the kernel.
//!
//! All of them are 128-bit values rendered as unpadded base32, which keeps
//! them URL-safe without escaping.

use crate::{array_type_define, array_type_impl_base32_str, array_type_impl_serde};

array_type_define!(
    /// Stable identifier of one page, assigned at creation, immutable.
    struct PageId, 16
);
array_type_impl_base32_str!(PageId);
array_type_impl_serde!(struct PageId, 16);

array_type_define!(
    /// Identifier of a single applied event within a page's log.
    struct EventRecordId, 16
);
array_type_impl_base32_str!(EventRecordId);
array_type_impl_serde!(struct EventRecordId, 16);

array_type_define!(
    /// Identifier of one orchestrator turn, shared by all model calls
    /// (including shadows) the turn issued.
    struct TurnId, 16
);
array_type_impl_base32_str!(TurnId);
array_type_impl_serde!(struct TurnId, 16);
