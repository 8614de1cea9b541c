// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Server-side trusted release pipeline.

This crate implements the publishing half of a project distribution
service. A release request names a git tag; the pipeline clones that tag,
checks that enough distinct trusted PGP keys signed it, builds the release
artifacts inside a disposable container, and publishes the resulting files
into a TUF repository under freshly signed metadata.

Requests are asynchronous. [release::ReleaseBackend::release] validates the
request, then enqueues a task with the [tasks::TaskManager]; a single
worker executes tasks serially, persisting their lifecycle so a process
restart cannot leave phantom running tasks behind.

The hosting process provides durable key-value storage through the
[storage::Storage] trait and routes operator requests (configuration,
trusted key registration, release, task status) to the functions in the
corresponding modules. Logging goes through the `log` facade; the host
installs the transport.

A quick tour:

- [config]: persisted pipeline configuration and git credentials.
- [keys]: the trusted PGP public key set.
- [signatures]: distinct-signer verification of tags and commits.
- [gitrepo]: tag-pinned ephemeral clones.
- [manifest]: the per-project `trdl.yaml` release manifest.
- [docker]: sandboxed artifact builds.
- [publisher]: staging and committing TUF repository state.
- [tasks]: the persistent single-worker task queue.
- [release]: the release operation tying it all together.
*/

pub mod config;
pub mod docker;
pub mod error;
pub mod gitrepo;
pub mod keys;
pub mod manifest;
pub mod pipe;
pub mod publisher;
pub mod release;
pub mod signatures;
pub mod storage;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testutil;
