use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Upper bound on device credentials per subscriber.
pub const MAX_DEVICE_SLOTS: usize = 3;

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Name of the remote panel user backing a device slot. This is the only link
/// between a local slot and the panel's record.
pub fn device_credential_name(subscriber_id: i64, slot_index: usize) -> String {
    format!("{}_device{}", subscriber_id, slot_index)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscriber {
    pub id: i64,
    /// Minor currency units.
    pub balance: i64,
    pub is_trial: bool,
    pub is_active: bool,
    pub is_friend: bool,
    pub subscription_end_date: Option<DateTime<Utc>>,
    pub last_notice_on: Option<NaiveDate>,
    pub device_slots: DeviceSlots,
}

impl Subscriber {
    /// Whole days until the subscription ends, rounded up. Something ending
    /// later today is day 1, something that already ended is 0 or less.
    pub fn days_left(&self, now: DateTime<Utc>) -> Option<i64> {
        let end = self.subscription_end_date?;
        let millis = (end - now).num_milliseconds();
        let mut days = millis.div_euclid(MILLIS_PER_DAY);
        if millis.rem_euclid(MILLIS_PER_DAY) > 0 {
            days += 1;
        }
        Some(days)
    }

    /// Access is live only while `now < end`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.subscription_end_date.is_some_and(|end| end <= now)
    }
}

/// Ordered, 1-indexed device credential slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSlots(Vec<Option<String>>);

impl DeviceSlots {
    pub fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    pub fn get(&self, slot_index: usize) -> Option<&str> {
        slot_index
            .checked_sub(1)
            .and_then(|i| self.0.get(i))
            .and_then(|s| s.as_deref())
    }

    /// Grows the sequence when a stored slot lies past the current length.
    pub fn set(&mut self, slot_index: usize, value: Option<String>) {
        let Some(i) = slot_index.checked_sub(1) else {
            return;
        };
        if i >= self.0.len() {
            self.0.resize(i + 1, None);
        }
        self.0[i] = value.filter(|v| !v.is_empty());
    }

    /// `(slot_index, credential)` for every slot, populated or not.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Option<&str>)> {
        self.0.iter().enumerate().map(|(i, s)| (i + 1, s.as_deref()))
    }

    pub fn populated(&self) -> impl Iterator<Item = (usize, &str)> {
        self.iter().filter_map(|(i, s)| s.map(|s| (i, s)))
    }
}
