//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The bidirectional JSON websocket protocol gluing the overlay tree

mod endpoint;
pub mod message;

pub use endpoint::Client;
pub use endpoint::ConnectError;
pub use endpoint::MessageHandler;
pub use endpoint::NullHandler;
pub use endpoint::Server;
pub use endpoint::ws_url;
