//! CLI command implementations.

pub mod compact;
pub mod dump;
pub mod inspect;
pub mod perf_blast;
pub mod verify;

use mqjournal_core::{list_journal_files, JournalConfig, MIN_FILE_SIZE};
use mqjournal_storage::{NioFileFactory, SequentialFileFactory};
use std::path::PathBuf;

/// Where the journal lives.
#[derive(Debug, Clone)]
pub struct JournalArgs {
    /// Journal directory.
    pub dir: PathBuf,
    /// File name prefix.
    pub prefix: String,
    /// File extension.
    pub extension: String,
}

impl JournalArgs {
    /// Configuration for opening an existing journal.
    pub fn config(&self) -> JournalConfig {
        JournalConfig::new()
            .journal_directory(&self.dir)
            .file_prefix(&self.prefix)
            .file_extension(&self.extension)
            .create_journal_dir(false)
    }

    /// Raw access to the journal files, without taking the directory lock.
    pub fn factory(&self) -> Result<NioFileFactory, Box<dyn std::error::Error>> {
        if !self.dir.is_dir() {
            return Err(format!("No journal directory at {:?}", self.dir).into());
        }
        Ok(NioFileFactory::new(&self.dir)?)
    }

    /// Sets the file size to that of the existing files, so that a
    /// recovering load does not resize the free ones.
    pub fn with_detected_file_size(
        &self,
        config: JournalConfig,
    ) -> Result<JournalConfig, Box<dyn std::error::Error>> {
        let factory = self.factory()?;
        let sizes = list_journal_files(&factory, &self.prefix, &self.extension)?
            .into_iter()
            .map(|(_, name)| factory.open_file(&name)?.size())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(match sizes.into_iter().max() {
            Some(size) if size >= MIN_FILE_SIZE => config.journal_file_size(size),
            _ => config,
        })
    }
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.0 MB");
    }

    #[test]
    fn config_never_creates_directories() {
        let args = JournalArgs {
            dir: PathBuf::from("/nonexistent"),
            prefix: "p".into(),
            extension: "e".into(),
        };
        let config = args.config();
        assert!(!config.create_journal_dir);
        assert_eq!(config.file_prefix, "p");
        assert!(args.factory().is_err());
    }
}
