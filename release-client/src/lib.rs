// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Client for channel-based project distribution over TUF.

A project publishes immutable releases and moving channel pointers into a
TUF repository. This crate keeps a local installation directory in sync
with a chosen channel: [client::Client::update_channel] refreshes the
verified repository metadata, resolves the channel's release, picks the
best matching platform variant, and installs exactly the files the signed
metadata describes. Selectors on [client::Client] then resolve installed
binaries for execution.

Downloads are verified by the TUF library against the signed metadata;
already present, hash-equal files are never re-downloaded. Updates run
under cross-process advisory locks so concurrent invocations do not race.
*/

pub mod client;
pub mod error;
pub mod locker;
pub mod tuf;
pub mod update;

pub use {
    client::{no_self_update_from_env, validate_channel, Client, CHANNELS},
    error::{ClientError, Result},
};
