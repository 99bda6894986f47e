/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::logger::{INFO_SYMBOL, LOGGER_PREFIX};

/// A wrapper around indicatif ProgressBar, styled like the logger.
pub struct ObscuraProgress {
    pb: ProgressBar,
}

impl ObscuraProgress {
    pub fn new(total_size: u64) -> Self {
        let prefix = format!("{} {}", LOGGER_PREFIX.bold().yellow(), INFO_SYMBOL.yellow());

        let pb = ProgressBar::new(total_size);
        let template = format!(
            "{}  [{{bar:40.yellow/red}}] {{bytes}}/{{total_bytes}} ({{elapsed}} / ETA: {{eta}}, {{bytes_per_sec}}) {{msg}}",
            prefix
        );
        if let Ok(style) = ProgressStyle::with_template(&template) {
            pb.set_style(style.progress_chars("##-"));
        }

        Self { pb }
    }

    pub fn update(&self, done: u64, msg: &'static str) {
        self.pb.set_position(done);
        self.pb.set_message(msg);
    }

    pub fn set_length(&self, len: u64) {
        if self.pb.length() != Some(len) {
            self.pb.set_length(len);
        }
    }

    pub fn finish(&self, msg: &'static str) {
        self.pb.finish_with_message(msg);
    }

    pub fn abandon(&self, msg: &'static str) {
        self.pb.abandon_with_message(msg);
    }

    /// Progress callback for the device operations, finishing the bar at the end.
    pub fn callback<'a>(
        &'a self,
        msg: &'static str,
        done_msg: &'static str,
    ) -> impl FnMut(usize, usize) + Send + 'a {
        move |done: usize, total: usize| {
            self.update(done as u64, msg);
            if done >= total {
                self.finish(done_msg);
            }
        }
    }
}
