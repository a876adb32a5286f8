//! `probetun` tunnels a reliable byte stream between clients and a server over
//! IEEE 802.11 probe-request / probe-response management frames. Clients hide
//! payload bytes in the SSID (and optionally a vendor-specific) information
//! element of broadcast probe-requests; the server decodes them off a kernel
//! multicast channel and answers through directed probe-responses emitted by a
//! patched WLAN firmware.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod net;
