// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wall-clock window predicates used by the scheduler to gate stages.

use chrono::{DateTime, Timelike, Utc};

/// A stage's time-of-day gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// `[start_hour, end_hour)`, e.g. `[10, 22)`.
    Day,
    /// The complement of `Day`.
    Night,
    /// No gating; the stage runs whenever the supervisor wants it to.
    Always,
}

impl Window {
    /// Whether `now` falls inside this window, given the configured day
    /// boundaries (`day_start_hour`, `day_end_hour`, both in `0..24`).
    #[must_use]
    pub fn contains(self, now: DateTime<Utc>, day_start_hour: u32, day_end_hour: u32) -> bool {
        match self {
            Window::Always => true,
            Window::Day => in_day_window(now, day_start_hour, day_end_hour),
            Window::Night => !in_day_window(now, day_start_hour, day_end_hour),
        }
    }
}

fn in_day_window(now: DateTime<Utc>, day_start_hour: u32, day_end_hour: u32) -> bool {
    let hour = now.hour();
    if day_start_hour <= day_end_hour {
        hour >= day_start_hour && hour < day_end_hour
    } else {
        // Window wraps past midnight, e.g. start=22, end=6.
        hour >= day_start_hour || hour < day_end_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn day_window_boundaries() {
        assert!(!Window::Day.contains(at(9), 10, 22));
        assert!(Window::Day.contains(at(10), 10, 22));
        assert!(Window::Day.contains(at(21), 10, 22));
        assert!(!Window::Day.contains(at(22), 10, 22));
    }

    #[test]
    fn night_is_exact_complement_of_day() {
        for hour in 0..24 {
            let now = at(hour);
            assert_eq!(
                Window::Night.contains(now, 10, 22),
                !Window::Day.contains(now, 10, 22)
            );
        }
    }

    #[test]
    fn always_never_gates() {
        for hour in 0..24 {
            assert!(Window::Always.contains(at(hour), 10, 22));
        }
    }
}
