use std::fs::{self, File, OpenOptions, create_dir_all};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::{PAGE_SIZE, Page, PageKey};

/// Maps page identities to files under `root/tables/<table>/` and moves
/// whole pages between disk and memory. Page bytes are authoritative on
/// disk; the per-table metadata blob is a directory into them.
pub struct DiskManager {
    root: PathBuf,
}

impl DiskManager {
    pub fn open<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        crate::strata_debug_log!("[DiskManager::open] Opening database root at: {root:?}");
        create_dir_all(root.join("tables"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join("tables").join(table)
    }

    fn page_path(&self, key: &PageKey) -> io::Result<PathBuf> {
        let dir = self.table_dir(&key.table);
        if !dir.is_dir() {
            create_dir_all(&dir)?;
        }
        Ok(dir.join(format!(
            "{}_{}_{}_{}.bin",
            key.kind.as_str(),
            key.column,
            key.range,
            key.page
        )))
    }

    /// Read a full page. A page that has never been written reads as a
    /// zero-filled buffer.
    pub fn read_page(&self, key: &PageKey) -> io::Result<Page> {
        let path = self.page_path(key)?;
        if !path.exists() {
            crate::strata_debug_log!("[DiskManager::read_page] Page {key:?} is new, zero-filled.");
            return Ok(Page::new());
        }

        let mut file = File::open(&path)?;
        let mut buf = [0u8; PAGE_SIZE];
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(Page::from_bytes(buf))
    }

    pub fn write_page(&self, key: &PageKey, page: &Page) -> io::Result<()> {
        let path = self.page_path(key)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(page.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn meta_path(&self, table: &str) -> PathBuf {
        self.table_dir(table).join("meta.json")
    }

    /// Store the per-table metadata blob atomically (write-to-temp plus
    /// rename). The schema is owned by the engine; the disk manager treats
    /// it as an opaque JSON value.
    pub fn write_meta(&self, table: &str, meta: &serde_json::Value) -> io::Result<()> {
        create_dir_all(self.table_dir(table))?;
        let bytes = serde_json::to_vec(meta)?;
        let path = self.meta_path(table);
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read_meta(&self, table: &str) -> io::Result<Option<serde_json::Value>> {
        let path = self.meta_path(table);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Drop every on-disk file belonging to a table.
    pub fn remove_table(&self, table: &str) -> io::Result<()> {
        let dir = self.table_dir(table);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Names of every table with an on-disk directory.
    pub fn list_tables(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join("tables"))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
