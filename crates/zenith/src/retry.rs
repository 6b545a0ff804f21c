// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Backoff step tables for subscription retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Selects which delay step table governs a subscription's retry spacing.
#[derive(
    Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, AsRefStr, Serialize, Deserialize,
)]
pub enum RetryDelayPolicy {
    /// The subscription must never be retried; requesting a delay is a
    /// programming error.
    Never,
    #[default]
    Default,
    /// Topics addressable by a stable reference.
    Referencable,
    /// Topics with no stable reference.
    NonReferencable,
}

/// Returns the backoff before retry attempt `attempt` (1-based).
///
/// # Panics
///
/// Panics if `policy` is [`RetryDelayPolicy::Never`] or `attempt` is zero.
#[must_use]
pub fn retry_delay(policy: RetryDelayPolicy, attempt: u32) -> Duration {
    assert!(attempt >= 1, "retry attempt counts are 1-based");

    let millis = match policy {
        RetryDelayPolicy::Never => {
            panic!("retry delay requested for a Never-retry subscription")
        }
        RetryDelayPolicy::Default | RetryDelayPolicy::Referencable => match attempt {
            1 => 8_000,
            2 => 16_000,
            3..=6 => 40_000,
            _ => 300_000,
        },
        RetryDelayPolicy::NonReferencable => match attempt {
            1 => 5_000,
            2 => 16_000,
            3..=6 => 40_000,
            _ => 480_000,
        },
    };

    Duration::from_millis(millis)
}
