/// How a sender's `start` relates to the delivery of its completion.
///
/// This is a hint published by every sender; composed senders derive their
/// own hint from their stages via [`Blocking::seq`]. Algorithms may use it
/// to elide synchronization (an `AlwaysInline` chain needs no event), but
/// it never changes observable completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocking {
    /// The completion is delivered on the starting thread, before `start`
    /// returns.
    AlwaysInline,
    /// The completion is delivered before `start` returns, possibly on
    /// another thread.
    Always,
    /// The completion may or may not have been delivered by the time
    /// `start` returns.
    Maybe,
    /// The completion is never delivered before `start` returns.
    Never,
}

impl Blocking {
    /// Combines the hints of two sequentially composed stages.
    ///
    /// | first          | second         | result         |
    /// |----------------|----------------|----------------|
    /// | `Never`        | any            | `Never`        |
    /// | any            | `Never`        | `Never`        |
    /// | `AlwaysInline` | `AlwaysInline` | `AlwaysInline` |
    /// | inline/always  | inline/always  | `Always`       |
    /// | otherwise      |                | `Maybe`        |
    #[must_use]
    pub const fn seq(self, next: Blocking) -> Blocking {
        use Blocking::*;
        match (self, next) {
            (Never, _) | (_, Never) => Never,
            (AlwaysInline, AlwaysInline) => AlwaysInline,
            (AlwaysInline | Always, AlwaysInline | Always) => Always,
            _ => Maybe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Blocking::*;

    /// `Never` on either side dominates the composition
    #[test]
    fn test_never_dominates() {
        assert_eq!(Never.seq(AlwaysInline), Never);
        assert_eq!(Never.seq(Always), Never);
        assert_eq!(Maybe.seq(Never), Never);
        assert_eq!(Never.seq(Never), Never);
    }

    /// Two inline stages stay inline, mixed blocking stages degrade to `Always`
    #[test]
    fn test_blocking_chains() {
        assert_eq!(AlwaysInline.seq(AlwaysInline), AlwaysInline);
        assert_eq!(AlwaysInline.seq(Always), Always);
        assert_eq!(Always.seq(AlwaysInline), Always);
        assert_eq!(Always.seq(Always), Always);
    }

    /// `Maybe` is the fallback whenever a stage is unknown
    #[test]
    fn test_maybe_fallback() {
        assert_eq!(Maybe.seq(AlwaysInline), Maybe);
        assert_eq!(Always.seq(Maybe), Maybe);
        assert_eq!(Maybe.seq(Maybe), Maybe);
    }
}
