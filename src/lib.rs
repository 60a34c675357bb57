// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod dispatch;
mod errors;
mod exec;
mod install;
#[cfg(test)]
mod mock_session;
mod ssh;
#[cfg(test)]
mod test_helpers;
mod transfer;
mod tunnel;
mod verify;

pub use dispatch::*;
