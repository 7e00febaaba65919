/// Urgency of a queued event.
///
/// Priority decides which bucket of the queue an event lands in and how the
/// consumer picks between buckets with ready work. It never reorders events
/// within a bucket: there, scheduled time and insertion order rule.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Priority {
    /// Dispatched only when the queue has nothing else that is ready.
    Idle,

    /// Ordinary traffic. The default for submissions.
    Low,

    /// Preferred over low-priority work, subject to bounded interleaving so
    /// low-priority work cannot starve.
    High,

    /// Preferred over everything, subject to the same bounded interleaving.
    Immediate,
}

impl Priority {
    /// Index of the realtime bucket for this priority, ordered from most to
    /// least urgent. Idle work lives outside the realtime buckets.
    pub(crate) fn bucket_index(self) -> Option<usize> {
        match self {
            Self::Immediate => Some(0),
            Self::High => Some(1),
            Self::Low => Some(2),
            Self::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_order_is_most_urgent_first() {
        assert_eq!(Priority::Immediate.bucket_index(), Some(0));
        assert_eq!(Priority::High.bucket_index(), Some(1));
        assert_eq!(Priority::Low.bucket_index(), Some(2));
        assert_eq!(Priority::Idle.bucket_index(), None);
    }
}
