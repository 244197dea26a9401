//! The ordered policy phase state machine
//!
//! Progress through the bootstrap is a strict linear order; the rollback
//! transaction uses it to know whether mutation has begun, and every audit
//! event records the phase it belongs to.

/// Bootstrap progress, in execution order.
///
/// `Collecting` runs with an empty (permissive) ruleset: the flush has
/// happened, the lockdown has not.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::AsRefStr,
)]
pub enum PolicyPhase {
    /// All prior tables, chains, and the old collection are gone
    #[strum(serialize = "flushed")]
    Flushed,
    /// Container DNS NAT rules have been reinstated
    #[strum(serialize = "dns-restored")]
    DnsRestored,
    /// Allow-list sources are being gathered (network is permissive)
    #[strum(serialize = "collecting")]
    Collecting,
    /// The address collection is loaded into the kernel
    #[strum(serialize = "allowlist-ready")]
    AllowlistReady,
    /// The host /24 has been derived and validated
    #[strum(serialize = "host-detected")]
    HostDetected,
    /// Default-deny policy is installed
    #[strum(serialize = "locked-down")]
    LockedDown,
}
