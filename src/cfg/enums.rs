// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Transport variants a server is willing to accept.
///
/// `PlainTls` sniffs the first inbound byte of every connection to route it
/// to the matching stream type; the single-variant modes route without
/// sniffing.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    #[serde(rename = "Plain", alias = "plain", alias = "PLAIN")]
    Plain,
    #[serde(rename = "Tls", alias = "tls", alias = "TLS")]
    Tls,
    #[serde(
        rename = "PlainTls",
        alias = "plain_tls",
        alias = "plain|tls",
        alias = "both"
    )]
    PlainTls,
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamMode::Plain => "Plain",
            StreamMode::Tls => "Tls",
            StreamMode::PlainTls => "PlainTls",
        })
    }
}

impl StreamMode {
    pub fn allows_plain(self) -> bool {
        matches!(self, StreamMode::Plain | StreamMode::PlainTls)
    }

    pub fn allows_tls(self) -> bool {
        matches!(self, StreamMode::Tls | StreamMode::PlainTls)
    }
}
