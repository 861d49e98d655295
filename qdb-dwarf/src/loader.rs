//! ELFとDWARFの読み込み機能

use crate::Result;
use object::{Object, ObjectKind, ObjectSection};
use std::fs;
use std::path::{Path, PathBuf};

/// DWARFセクション（'staticなファイルデータを指す）
pub type DwarfSections = gimli::Dwarf<gimli::EndianSlice<'static, gimli::RunTimeEndian>>;

/// ELFファイルのローダー
pub struct DwarfLoader {
    path: PathBuf,
    /// ファイルの中身。シンボルテーブルや行情報から参照されるため'staticで保持する
    data: &'static [u8],
    object_file: object::File<'static>,
}

impl DwarfLoader {
    /// ELFファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file_data = fs::read(path).map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // モジュールはセッション終了まで使い続けるため、リークして'staticにする
        let data: &'static [u8] = Box::leak(file_data.into_boxed_slice());
        let object_file = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        tracing::debug!(path = %path.display(), "loaded image");
        Ok(Self {
            path: path.to_path_buf(),
            data,
            object_file,
        })
    }

    /// ファイルパスを取得
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ファイルデータを取得
    pub fn data(&self) -> &'static [u8] {
        self.data
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// 位置独立（ET_DYN）かどうか
    ///
    /// PIE実行ファイルと共有ライブラリはロードバイアスの加算が必要で、
    /// ET_EXECのシンボルアドレスはそのまま絶対アドレスです。
    pub fn is_pie(&self) -> bool {
        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }

    /// エントリポイント（ファイル上の仮想アドレス）
    pub fn entry(&self) -> u64 {
        self.object_file.entry()
    }

    /// DWARFセクションを読み込む
    pub fn dwarf(&self) -> Result<DwarfSections> {
        load_dwarf(self.data)
    }
}

/// ファイルデータからDWARFセクションを構築する
pub(crate) fn load_dwarf(data: &'static [u8]) -> Result<DwarfSections> {
    let object_file = object::File::parse(data).map_err(|e| anyhow::anyhow!("Failed to parse ELF data: {}", e))?;
    let endian = if object_file.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> Result<gimli::EndianSlice<'static, gimli::RunTimeEndian>> {
        let bytes = object_file
            .section_by_name(id.name())
            .and_then(|section| section.data().ok())
            .unwrap_or(&[]);
        Ok(gimli::EndianSlice::new(bytes, endian))
    };

    gimli::Dwarf::load(load_section).map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
}
