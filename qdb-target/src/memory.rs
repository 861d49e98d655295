//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// 補助ベクタのエントリポイントのキー
const AT_ENTRY: u64 = 9;

/// メモリマッピング情報（/proc/pid/mapsの1行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// マッピング元ファイル内のオフセット
    pub offset: u64,
    /// マッピング元ファイル（匿名マッピングや[stack]等はNone）
    pub path: Option<PathBuf>,
}

impl MemoryMapping {
    /// mapsの1行をパースする
    ///
    /// フォーマット: "address perms offset dev inode pathname"
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let perms = fields.next()?.as_bytes();
        let offset = fields.next()?;
        // dev, inode
        fields.next()?;
        fields.next()?;
        let path = fields.collect::<Vec<_>>().join(" ");

        Some(Self {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset: u64::from_str_radix(offset, 16).ok()?,
            path: path.starts_with('/').then(|| PathBuf::from(path)),
        })
    }

    /// アドレスがこのマッピング内にあるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    fn proc_path(&self, entry: &str) -> String {
        format!("/proc/{}/{}", self.pid, entry)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memで読めない場合（EIO）はPTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.proc_path("mem");
        let file = File::open(&mem_path).map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        let mut buffer = vec![0u8; size];
        match file.read_exact_at(&mut buffer, addr) {
            Ok(()) => Ok(buffer),
            Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => self.read_via_ptrace(addr, size),
            Err(e) => Err(anyhow::anyhow!("Failed to read {} bytes at 0x{:x}: {}", size, addr, e)),
        }
    }

    /// メモリにデータを書き込む
    ///
    /// ptrace停止中のプロセスであれば読み取り専用のテキストページにも書き込めます。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mem_path = self.proc_path("mem");
        let file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.write_all_at(data, addr)
            .map_err(|e| anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e))
    }

    /// 1〜8バイトの符号なし整数を読み取る（リトルエンディアン）
    pub fn read_uint(&self, addr: u64, size: usize) -> Result<u64> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(anyhow::anyhow!("Unsupported read size {}", size));
        }
        let bytes = self.read(addr, size)?;
        let mut word = [0u8; 8];
        word[..size].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    /// u8値を読み取る
    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        Ok(self.read_uint(addr, 1)? as u8)
    }

    /// u8値を書き込む
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<()> {
        self.write(addr, &[value])
    }

    /// u64値を読み取る
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        self.read_uint(addr, 8)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = self.proc_path("maps");
        let file = File::open(&maps_path).map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;

        let mut mappings = Vec::new();
        for line in BufReader::new(file).lines() {
            if let Some(mapping) = MemoryMapping::parse(&line?) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }

    /// ファイルがロードされているベースアドレス（ロードバイアス）を取得する
    ///
    /// そのファイルの最も低いアドレスのマッピングから、ファイルオフセットを引いた値です。
    /// ファイルがまだマップされていなければNoneを返します。
    pub fn load_bias(&self, path: &Path) -> Result<Option<u64>> {
        let bias = self
            .get_mappings()?
            .into_iter()
            .filter(|m| m.path.as_deref() == Some(path))
            .min_by_key(|m| m.start)
            .map(|m| m.start.wrapping_sub(m.offset));
        Ok(bias)
    }

    /// 実行可能セグメントを持つファイルの一覧（マップ順、重複なし）
    pub fn executable_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = Vec::new();
        for mapping in self.get_mappings()? {
            if let (true, Some(path)) = (mapping.executable, mapping.path) {
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }

    /// 補助ベクタ（/proc/pid/auxv）のAT_ENTRY、つまりプログラムのエントリポイント
    pub fn entry_point(&self) -> Result<u64> {
        let auxv_path = self.proc_path("auxv");
        let auxv = std::fs::read(&auxv_path).map_err(|e| anyhow::anyhow!("Failed to read {}: {}", auxv_path, e))?;

        auxv.chunks_exact(16)
            .map(|pair| {
                let mut key = [0u8; 8];
                let mut value = [0u8; 8];
                key.copy_from_slice(&pair[..8]);
                value.copy_from_slice(&pair[8..]);
                (u64::from_ne_bytes(key), u64::from_ne_bytes(value))
            })
            .find(|(key, _)| *key == AT_ENTRY)
            .map(|(_, value)| value)
            .ok_or_else(|| anyhow::anyhow!("AT_ENTRY not found in {}", auxv_path))
    }

    /// PTRACE_PEEKDATAでワード単位に読み取る
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<nix::libc::c_long>();
        let mut data = Vec::with_capacity(size + word_size);

        let mut offset = 0;
        while offset < size {
            let word_addr = addr + offset as u64;
            let word = ptrace::read(self.pid, word_addr as ptrace::AddressType)
                .map_err(|e| anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", word_addr, e))?;
            data.extend_from_slice(&word.to_ne_bytes());
            offset += word_size;
        }

        data.truncate(size);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_mapping() {
        let line = "7f1234567000-7f1234568000 r-xp 00001000 08:01 123456   /usr/lib/libc.so.6";
        let m = MemoryMapping::parse(line).unwrap();
        assert_eq!(m.start, 0x7f1234567000);
        assert_eq!(m.end, 0x7f1234568000);
        assert!(m.readable && !m.writable && m.executable);
        assert_eq!(m.offset, 0x1000);
        assert_eq!(m.path.as_deref(), Some(Path::new("/usr/lib/libc.so.6")));
        assert!(m.contains(0x7f1234567abc));
        assert!(!m.contains(0x7f1234568000));
    }

    #[test]
    fn test_parse_anonymous_mapping() {
        let stack = MemoryMapping::parse("7ffc0000-7ffd0000 rw-p 00000000 00:00 0 [stack]").unwrap();
        assert_eq!(stack.path, None);

        let anon = MemoryMapping::parse("7ffc0000-7ffd0000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(anon.path, None);
    }

    #[test]
    fn test_parse_malformed_mapping() {
        assert!(MemoryMapping::parse("").is_none());
        assert!(MemoryMapping::parse("zzzz-1000 r-xp 0 0:0 0").is_none());
    }

    #[test]
    fn test_own_mappings() {
        let memory = Memory::new(std::process::id() as i32);
        let exe = std::env::current_exe().unwrap().canonicalize().unwrap();

        let files = memory.executable_files().unwrap();
        assert!(files.contains(&exe));
        assert!(memory.load_bias(&exe).unwrap().is_some());
        assert!(memory.load_bias(Path::new("/nonexistent/file")).unwrap().is_none());
    }

    #[test]
    fn test_read_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let memory = Memory::new(std::process::id() as i32);
        let addr = &value as *const u64 as u64;

        assert_eq!(memory.read_u64(addr).unwrap(), value);
        assert_eq!(memory.read_u8(addr).unwrap(), 0x88);
        assert_eq!(memory.read_uint(addr, 2).unwrap(), 0x7788);
        assert!(memory.read_uint(addr, 3).is_err());
    }

    #[test]
    fn test_own_entry_point() {
        let memory = Memory::new(std::process::id() as i32);
        let entry = memory.entry_point().unwrap();

        let mappings = memory.get_mappings().unwrap();
        let mapping = mappings.iter().find(|m| m.contains(entry)).unwrap();
        assert!(mapping.executable);
    }
}
