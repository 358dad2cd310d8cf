// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sunlink.dev

//! Protocol catalogue: declarative definitions of how to talk to each device
//! family, loaded from YAML at startup, plus the JSON register maps the
//! pollers execute.

pub mod definitions;
pub mod loader;
pub mod register_map;
pub mod registry;

pub use definitions::{
    CommandSettings, DeviceType, IdentificationSpec, ModbusSettings, PollingConfig,
    ProtocolDefinition, SerialEncoding, SerialNumberSpec, Transport,
};
pub use loader::{LoaderError, ProtocolLoader};
pub use register_map::{RegisterDescriptor, RegisterKind, RegisterMapCache, RegisterValue};
pub use registry::{ProtocolRegistry, RegistryError};
