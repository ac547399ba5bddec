// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

use chrono::Local;
use tracing::{error, info};

use crate::throttle::ThrottleControl;

/// Rolling CSV file writer with a disk-bandwidth quota.
pub(crate) struct MetricsFileOutput {
    dir: PathBuf,
    prefix: String,
    max_size_bytes: u64,
    file_count: usize,
    throttle: ThrottleControl,
    files: Vec<String>,
    current: Option<BufWriter<File>>,
    current_size: u64,
}

impl MetricsFileOutput {
    pub(crate) fn new(
        dir: &str,
        max_size_bytes: u64,
        file_count: usize,
        client_id: &str,
        write_threshold_bytes: i64,
    ) -> Self {
        assert!(max_size_bytes > 0, "metrics file size must be > 0");
        assert!(file_count > 0, "metrics file count must be > 0");

        let dir = PathBuf::from(dir);
        if !dir.exists() {
            fs::create_dir_all(&dir).expect("cannot create metrics output dir");
        }

        let throttle = ThrottleControl::new(write_threshold_bytes);
        throttle.start();

        let mut output = Self {
            dir,
            prefix: format!("ember_metrics_{client_id}_"),
            max_size_bytes,
            file_count,
            throttle,
            files: Vec::new(),
            current: None,
            current_size: 0,
        };
        output.scan_existing_files();
        output.roll_to_new_file();
        output
    }

    pub(crate) fn write_lines(&mut self, lines: &[String]) {
        if self.current_size > self.max_size_bytes {
            self.roll_to_new_file();
        }
        let Some(writer) = self.current.as_mut() else {
            error!("metrics output file is not open, dropping snapshot");
            return;
        };
        for line in lines {
            let size = line.len() as i64;
            self.throttle.check_write_quota(size);
            if let Err(e) = writeln!(writer, "{line}") {
                error!(error = %e, "failed writing metrics line");
                return;
            }
            self.current_size += line.len() as u64;
        }
    }

    pub(crate) fn flush(&mut self) {
        if let Some(writer) = self.current.as_mut() {
            if let Err(e) = writer.flush() {
                error!(error = %e, "failed flushing metrics file");
            }
        }
    }

    fn roll_to_new_file(&mut self) {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let file_name = format!("{}{}.log", self.prefix, stamp);
        let path = self.dir.join(&file_name);

        self.flush();
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                self.current = Some(BufWriter::new(file));
                self.current_size = 0;
                self.files.push(file_name);
                info!(file = %path.display(), "rolled to new metrics file");
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "cannot open metrics file");
                self.current = None;
            }
        }

        self.delete_oldest_over_limit();
    }

    fn scan_existing_files(&mut self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            error!(dir = %self.dir.display(), "cannot list metrics dir");
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&self.prefix) {
                self.files.push(name);
            }
        }
        self.files.sort();
    }

    fn delete_oldest_over_limit(&mut self) {
        if self.files.len() <= self.file_count {
            return;
        }
        self.files.sort();
        while self.files.len() > self.file_count {
            let name = self.files.remove(0);
            let path = self.dir.join(&name);
            match fs::remove_file(&path) {
                Ok(()) => info!(file = %path.display(), "deleted old metrics file"),
                Err(e) => error!(file = %path.display(), error = %e, "cannot delete metrics file"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("embermetrics-test-{}", uuid::Uuid::new_v4()))
    }

    fn list_logs(dir: &PathBuf) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn writes_lines_to_current_file() {
        let dir = temp_dir();
        let mut output =
            MetricsFileOutput::new(dir.to_str().unwrap(), 1024, 3, "abcde", 1_000_000);
        output.write_lines(&["mix,1,s,t,v,1,200,10".into()]);
        output.flush();

        let names = list_logs(&dir);
        assert_eq!(names.len(), 1);
        let content = fs::read_to_string(dir.join(&names[0])).unwrap();
        assert_eq!(content, "mix,1,s,t,v,1,200,10\n");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn oversized_file_rolls_and_old_files_are_deleted() {
        let dir = temp_dir();
        // 8-byte limit: every snapshot overflows the current file
        let mut output = MetricsFileOutput::new(dir.to_str().unwrap(), 8, 2, "abcde", 1_000_000);
        for i in 0..4 {
            output.write_lines(&[format!("counter-{i},1,42")]);
            output.flush();
            // distinct file-name timestamps need a tick between rolls
            std::thread::sleep(std::time::Duration::from_millis(1100));
        }
        let names = list_logs(&dir);
        assert!(names.len() <= 2, "kept {names:?}");
        fs::remove_dir_all(&dir).unwrap();
    }
}
