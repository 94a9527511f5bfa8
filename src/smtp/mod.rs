// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

pub mod client;
pub mod codec;
pub mod data;
pub mod extension;
pub mod server;
pub mod session;
pub mod syntax;
pub mod transport;
