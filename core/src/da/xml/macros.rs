/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

/// Declares an XML command: a plain struct with public fields, a positional
/// constructor and the [`XmlCommand`](crate::da::xml::cmds::XmlCommand) impl.
///
/// ```ignore
/// xml_command! {
///     pub struct Reboot("REBOOT") { action: String }
///     |c| [(None, "action", c.action.clone())]
/// }
/// ```
///
/// The optional second literal overrides the command version (`"1.0"` by default).
/// Each argument is `(section, tag, value)`, where a `None` section means `<arg>`.
macro_rules! xml_command {
    (@version) => {
        "1.0"
    };
    (@version $v:literal) => {
        $v
    };
    (
        $(#[$meta:meta])*
        pub struct $name:ident($cmd:literal $(, $ver:literal)?) {
            $($field:ident : $ty:ty),* $(,)?
        }
        |$c:ident| [ $(($section:expr, $tag:literal, $value:expr)),* $(,)? ]
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            $(pub $field: $ty),*
        }

        impl $name {
            #[allow(clippy::new_without_default, clippy::too_many_arguments)]
            pub fn new($($field: $ty),*) -> Self {
                $name { $($field),* }
            }
        }

        impl $crate::da::xml::cmds::XmlCommand for $name {
            fn cmd_name(&self) -> &'static str {
                $cmd
            }

            fn version(&self) -> &'static str {
                xml_command!(@version $($ver)?)
            }

            fn args(&self) -> Vec<(Option<&'static str>, &'static str, String)> {
                #[allow(unused_variables)]
                let $c = self;
                vec![$(($section, $tag, $value)),*]
            }
        }
    };
}

/// Builds and sends a command, waiting for the whole `CMD:END`/`CMD:START` bracket.
macro_rules! xmlcmd {
    ($xml:expr, $cmd:ident $(, $arg:expr)* $(,)?) => {
        $xml.send_command(
            &$crate::da::xml::cmds::create_cmd(&$crate::da::xml::cmds::$cmd::new($($arg),*)),
            false,
        )
    };
}

/// Like [`xmlcmd!`], but returns as soon as the loader accepted the command,
/// leaving the data phase to the caller.
macro_rules! xmlcmd_noack {
    ($xml:expr, $cmd:ident $(, $arg:expr)* $(,)?) => {
        $xml.send_command(
            &$crate::da::xml::cmds::create_cmd(&$crate::da::xml::cmds::$cmd::new($($arg),*)),
            true,
        )
    };
}
