/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod connection;
pub mod core;
pub mod da;
pub mod device;
pub mod error;
pub mod utilities;

pub use connection::port::{ConnectionType, MTKPort, find_mtk_port};
pub use crate::core::chip::ChipConfig;
pub use crate::core::gpt::{GptTable, PartitionEntry};
pub use crate::core::seccfg::LockFlag;
pub use crate::core::sla::{SlaKey, SlaKeyring};
pub use crate::core::storage::{StorageInfo, StorageType};
pub use da::BootMode;
pub use device::{Device, DeviceBuilder};
pub use error::{Error, Result};
