/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::collections::BTreeMap;

pub const HOST_CMDS: &str =
    "CMD:DOWNLOAD-FILE^1@CMD:FILE-SYS-OPERATION^1@CMD:PROGRESS-REPORT^1@CMD:UPLOAD-FILE^1@";

/// Buffer the loader may use when it answers with a file.
pub const DEFAULT_TARGET: &str = "MEM://0x0:0x200000";

/// `MEM://` locations tell the loader the transfer goes through the host memory.
pub fn mem_file(offset: u64, length: u64) -> String {
    format!("MEM://0x{offset:x}:0x{length:x}")
}

/// Each XML command implements this trait, through the `xml_command!` macro.
pub trait XmlCommand {
    /// Name without the `CMD:` prefix.
    fn cmd_name(&self) -> &'static str;
    /// `(section, tag path, content)`. A `None` section means `<arg>`.
    fn args(&self) -> Vec<(Option<&'static str>, &'static str, String)>;
    fn version(&self) -> &'static str;
}

xml_command! {
    pub struct SetRuntimeParameter("SET-RUNTIME-PARAMETER", "1.1") {
        checksum_level: String,
        battery_exist: String,
        da_log_level: String,
        log_channel: String,
        system_os: String,
        initialize_dram: String,
    }
    |c| [
        (None, "checksum_level", c.checksum_level.clone()),
        (None, "battery_exist", c.battery_exist.clone()),
        (None, "da_log_level", c.da_log_level.clone()),
        (None, "log_channel", c.log_channel.clone()),
        (None, "system_os", c.system_os.clone()),
        (Some("adv"), "initialize_dram", c.initialize_dram.clone()),
    ]
}

xml_command! {
    pub struct HostSupportedCommands("HOST-SUPPORTED-COMMANDS") { host_capability: String }
    |c| [(None, "host_capability", c.host_capability.clone())]
}

xml_command! {
    pub struct NotifyInitHw("NOTIFY-INIT-HW") {}
    |c| []
}

xml_command! {
    pub struct SetHostInfo("SET-HOST-INFO") { info: String }
    |c| [(None, "info", c.info.clone())]
}

xml_command! {
    pub struct BootTo("BOOT-TO") { at_address: u64, jmp_address: u64, host_offset: u64, length: u64 }
    |c| [
        (None, "at_address", format!("0x{:x}", c.at_address)),
        (None, "jmp_address", format!("0x{:x}", c.jmp_address)),
        (None, "source_file", mem_file(c.host_offset, c.length)),
    ]
}

xml_command! {
    pub struct GetSysProperty("GET-SYS-PROPERTY") { key: String, length: u64 }
    |c| [
        (None, "key", c.key.clone()),
        (None, "target_file", mem_file(0, c.length)),
    ]
}

xml_command! {
    pub struct SecurityGetDevFwInfo("SECURITY-GET-DEV-FW-INFO") {}
    |c| [(None, "target_file", DEFAULT_TARGET.to_string())]
}

xml_command! {
    pub struct SecuritySetFlashPolicy("SECURITY-SET-FLASH-POLICY") { source_file: String }
    |c| [(None, "source_file", c.source_file.clone())]
}

xml_command! {
    pub struct GetHwInfo("GET-HW-INFO") {}
    |c| [(None, "target_file", DEFAULT_TARGET.to_string())]
}

xml_command! {
    pub struct CanHigherUsbSpeed("CAN-HIGHER-USB-SPEED") {}
    |c| [(None, "target_file", DEFAULT_TARGET.to_string())]
}

xml_command! {
    pub struct EmmcControl("EMMC-CONTROL") { function: String }
    |c| [
        (None, "function", c.function.clone()),
        (None, "target_file", DEFAULT_TARGET.to_string()),
    ]
}

xml_command! {
    pub struct ReadPartitionTable("READ-PARTITION-TABLE") {}
    |c| [(None, "target_file", DEFAULT_TARGET.to_string())]
}

xml_command! {
    pub struct ReadFlash("READ-FLASH") { partition: String, offset: u64, length: u64 }
    |c| [
        (None, "partition", c.partition.clone()),
        (None, "offset", format!("0x{:x}", c.offset)),
        (None, "length", format!("0x{:x}", c.length)),
        (None, "target_file", mem_file(0, c.length)),
    ]
}

xml_command! {
    pub struct WriteFlash("WRITE-FLASH") { partition: String, offset: u64, length: u64 }
    |c| [
        (None, "partition", c.partition.clone()),
        (None, "offset", format!("0x{:x}", c.offset)),
        (None, "source_file", mem_file(0, c.length)),
    ]
}

xml_command! {
    pub struct EraseFlash("ERASE-FLASH") { partition: String, offset: u64, length: u64 }
    |c| [
        (None, "partition", c.partition.clone()),
        (None, "offset", format!("0x{:x}", c.offset)),
        (None, "length", format!("0x{:x}", c.length)),
    ]
}

xml_command! {
    pub struct SetBootMode("SET-BOOT-MODE") {
        mode: String,
        connect_type: String,
        mobile_log: String,
        adb: String,
    }
    |c| [
        (None, "mode", c.mode.clone()),
        (None, "connect_type", c.connect_type.clone()),
        (None, "mobile_log", c.mobile_log.clone()),
        (None, "adb", c.adb.clone()),
    ]
}

xml_command! {
    pub struct Reboot("REBOOT") { action: String }
    |c| [(None, "action", c.action.clone())]
}

xml_command! {
    pub struct WriteRegister("WRITE-REGISTER") { base_address: u32, length: u64 }
    |c| [
        (None, "bit_width", "32".to_string()),
        (None, "base_address", format!("0x{:x}", c.base_address)),
        (None, "source_file", mem_file(0, c.length)),
    ]
}

xml_command! {
    pub struct ReadRegister("READ-REGISTER") { base_address: u32 }
    |c| [
        (None, "bit_width", "32".to_string()),
        (None, "base_address", format!("0x{:x}", c.base_address)),
    ]
}

pub fn create_cmd<C: XmlCommand>(cmd: &C) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="utf-8"?><da><version>{}</version><command>CMD:{}</command>"#,
        cmd.version(),
        cmd.cmd_name()
    );

    let mut sections: BTreeMap<Option<&str>, Vec<(&str, String)>> = BTreeMap::new();

    for (section, tag, content) in cmd.args() {
        sections.entry(section).or_default().push((tag, content));
    }

    for (section, entries) in sections {
        let tag = section.unwrap_or("arg");
        xml.push_str(&format!("<{}>", tag));
        for (tag_path, content) in entries {
            let parts: Vec<&str> = tag_path.split('/').collect();

            for p in &parts {
                xml.push_str(&format!("<{}>", p));
            }

            xml.push_str(&content);

            for p in parts.iter().rev() {
                xml.push_str(&format!("</{}>", p));
            }
        }
        xml.push_str(&format!("</{}>", tag));
    }

    xml.push_str("</da>");
    xml
}

/// Commands added by the `CMD:CUSTOM` hook have no arguments at all.
pub fn create_bare_cmd(name: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><da><version>1.0</version><command>CMD:{name}</command></da>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_grouped() {
        let cmd = SetRuntimeParameter::new(
            "NONE".into(),
            "AUTO-DETECT".into(),
            "INFO".into(),
            "UART".into(),
            "LINUX".into(),
            "YES".into(),
        );
        let xml = create_cmd(&cmd);

        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="utf-8"?><da><version>1.1</version>"#));
        assert!(xml.contains("<command>CMD:SET-RUNTIME-PARAMETER</command><arg><checksum_level>NONE</checksum_level>"));
        assert!(xml.ends_with("<system_os>LINUX</system_os></arg><adv><initialize_dram>YES</initialize_dram></adv></da>"));
    }

    #[test]
    fn commands_render_their_arguments() {
        let xml = create_cmd(&BootTo::new(0x4000_0000, 0x4000_0000, 0, 0x5_0C78));
        assert!(xml.contains(
            "<arg><at_address>0x40000000</at_address><jmp_address>0x40000000</jmp_address><source_file>MEM://0x0:0x50c78</source_file></arg>"
        ));

        let xml = create_cmd(&NotifyInitHw::new());
        assert!(xml.ends_with("<command>CMD:NOTIFY-INIT-HW</command></da>"));

        let xml = create_cmd(&ReadFlash::new("UFS-LUA2".into(), 0x8000, 0x20000));
        assert!(xml.contains("<offset>0x8000</offset><length>0x20000</length><target_file>MEM://0x0:0x20000</target_file>"));

        let xml = create_cmd(&WriteRegister::new(0x1000_0000, 4));
        assert!(xml.contains("<bit_width>32</bit_width><base_address>0x10000000</base_address>"));
    }

    #[test]
    fn bare_commands() {
        assert_eq!(
            create_bare_cmd("CUSTOMACK"),
            r#"<?xml version="1.0" encoding="utf-8"?><da><version>1.0</version><command>CMD:CUSTOMACK</command></da>"#
        );
    }
}
