/*
 *  error.rs
 *
 *  PostBox - posts on glass
 *  (c) 2024-26 PostBox contributors
 *
 *  Fault taxonomy shared by the display driver, the feed client, and
 *  the supervisor.
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use thiserror::Error;

/// Every fault the device can hit. All of these bubble up to the
/// supervisor's single error handler, which is the only place that
/// decides retry vs. terminate.
#[derive(Debug, Error)]
pub enum Fault {
    /// Transport-level I2C failure, or a display operation invoked
    /// while no display handle is held.
    #[error("bus fault: {0}")]
    Bus(String),

    /// Invalid geometry, address, line index, or glyph slot.
    #[error("protocol fault: {0}")]
    Protocol(String),

    /// Credential rejection. Rate-limited and network-unreachable
    /// rejections are retriable; anything else is fatal.
    #[error("auth fault: {message}")]
    Auth { message: String, retriable: bool },

    /// Feed unreachable.
    #[error("network fault: {0}")]
    Network(String),

    /// Malformed post record. Non-fatal: logged and dropped without
    /// touching the consecutive-error counter.
    #[error("data fault: {0}")]
    Data(String),
}

impl Fault {
    pub fn is_data(&self) -> bool {
        matches!(self, Fault::Data(_))
    }

    /// A credential rejection that retrying cannot fix.
    pub fn is_fatal_auth(&self) -> bool {
        matches!(self, Fault::Auth { retriable: false, .. })
    }
}
