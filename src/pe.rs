//! Low-level PE file format access: header decoding and import directory walking
//!
//! Only the parts of the format needed to list the imported DLL names are decoded. Every read is
//! bounds-checked against the file content, so truncated or adversarial files produce an error
//! (for the headers) or a shorter import list (for the import directory), never a panic.

use crate::common::LookupError;
use dataview::{DataView, Pod};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const MIN_FILE_SIZE: usize = 256;
const DOS_SIGNATURE: u16 = 0x5A4D; // MZ
const PE_POINTER_OFFSET: usize = 0x3C;
const PE_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
const FILE_HEADER_SIZE: usize = 24; // signature + COFF file header
const OPTIONAL_MAGIC_PE32: u16 = 0x10B;
const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20B;
const DATA_DIRECTORY_ENTRY_SIZE: usize = 8;
const SECTION_DESCRIPTOR_SIZE: usize = 40;
const IMPORT_DESCRIPTOR_SIZE: usize = 20;
const MAX_MODULE_NAME_LEN: usize = 260;

/// Section table entry, as laid out in the file
#[derive(Pod, Clone, Copy, Debug, Default)]
#[repr(C)]
struct SectionDescriptor {
    #[allow(dead_code)]
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    #[allow(dead_code)]
    pointer_to_relocations: u32,
    #[allow(dead_code)]
    pointer_to_linenumbers: u32,
    #[allow(dead_code)]
    number_of_relocations: u16,
    #[allow(dead_code)]
    number_of_linenumbers: u16,
    #[allow(dead_code)]
    characteristics: u32,
}

impl SectionDescriptor {
    fn from_le(self) -> Self {
        Self {
            name: self.name,
            virtual_size: u32::from_le(self.virtual_size),
            virtual_address: u32::from_le(self.virtual_address),
            size_of_raw_data: u32::from_le(self.size_of_raw_data),
            pointer_to_raw_data: u32::from_le(self.pointer_to_raw_data),
            pointer_to_relocations: u32::from_le(self.pointer_to_relocations),
            pointer_to_linenumbers: u32::from_le(self.pointer_to_linenumbers),
            number_of_relocations: u16::from_le(self.number_of_relocations),
            number_of_linenumbers: u16::from_le(self.number_of_linenumbers),
            characteristics: u32::from_le(self.characteristics),
        }
    }

    /// File offset of the given RVA, if it falls within this section
    fn translate(&self, rva: u32) -> Option<usize> {
        if self.pointer_to_raw_data == 0 {
            return None;
        }
        let start = u64::from(self.virtual_address);
        let extent = u64::from(self.virtual_size.max(self.size_of_raw_data));
        let rva = u64::from(rva);
        if rva >= start && rva < start + extent {
            usize::try_from(u64::from(self.pointer_to_raw_data) + (rva - start)).ok()
        } else {
            None
        }
    }
}

/// IMAGE_IMPORT_DESCRIPTOR
#[derive(Pod, Clone, Copy, Debug, Default)]
#[repr(C)]
struct ImportDescriptor {
    original_first_thunk: u32,
    #[allow(dead_code)]
    time_date_stamp: u32,
    #[allow(dead_code)]
    forwarder_chain: u32,
    name: u32,
    first_thunk: u32,
}

impl ImportDescriptor {
    fn from_le(self) -> Self {
        Self {
            original_first_thunk: u32::from_le(self.original_first_thunk),
            time_date_stamp: u32::from_le(self.time_date_stamp),
            forwarder_chain: u32::from_le(self.forwarder_chain),
            name: u32::from_le(self.name),
            first_thunk: u32::from_le(self.first_thunk),
        }
    }

    // the terminating record only has to be zero in these three fields
    fn is_terminator(&self) -> bool {
        self.original_first_thunk == 0 && self.name == 0 && self.first_thunk == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionalHeaderLayout {
    Pe32,
    Pe32Plus,
}

impl OptionalHeaderLayout {
    fn from_magic(magic: u16) -> Option<Self> {
        match magic {
            OPTIONAL_MAGIC_PE32 => Some(Self::Pe32),
            OPTIONAL_MAGIC_PE32_PLUS => Some(Self::Pe32Plus),
            _ => None,
        }
    }

    /// Offset of the data directory array within the optional header
    fn data_directories_offset(self) -> usize {
        match self {
            Self::Pe32 => 0x60,
            Self::Pe32Plus => 0x70,
        }
    }

    fn min_optional_header_size(self) -> usize {
        self.data_directories_offset() + DATA_DIRECTORY_ENTRY_SIZE
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DataDirectory {
    rva: u32,
    size: u32,
}

/// Everything the import extractor needs from the headers
#[derive(Debug)]
struct HeaderFacts {
    machine: u16,
    layout: OptionalHeaderLayout,
    import_directory: DataDirectory,
    sections: Vec<SectionDescriptor>,
}

impl HeaderFacts {
    /// Translate an RVA to a file offset through the section table
    fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        if rva == 0 {
            return None;
        }
        self.sections.iter().find_map(|s| s.translate(rva))
    }
}

/// Little-endian field access that turns short reads into a `Truncated` error
struct FieldReader<'a> {
    view: &'a DataView,
    path: &'a Path,
}

impl<'a> FieldReader<'a> {
    fn truncated(&self, what: &'static str) -> LookupError {
        LookupError::Truncated {
            path: self.path.to_owned(),
            what,
        }
    }

    fn u16(&self, offset: usize, what: &'static str) -> Result<u16, LookupError> {
        self.view
            .try_read::<u16>(offset)
            .map(u16::from_le)
            .ok_or_else(|| self.truncated(what))
    }

    fn u32(&self, offset: usize, what: &'static str) -> Result<u32, LookupError> {
        self.view
            .try_read::<u32>(offset)
            .map(u32::from_le)
            .ok_or_else(|| self.truncated(what))
    }
}

fn decode_headers(path: &Path, bytes: &[u8]) -> Result<HeaderFacts, LookupError> {
    if bytes.len() < MIN_FILE_SIZE {
        return Err(LookupError::TooSmall {
            path: path.to_owned(),
            len: bytes.len(),
        });
    }
    let reader = FieldReader {
        view: DataView::from(bytes),
        path,
    };

    if reader.u16(0, "DOS header")? != DOS_SIGNATURE {
        return Err(LookupError::BadDosSignature {
            path: path.to_owned(),
        });
    }

    let header_offset = reader.u32(PE_POINTER_OFFSET, "DOS header")?;
    let pe_start = header_offset as usize;
    if pe_start > bytes.len() - FILE_HEADER_SIZE {
        return Err(LookupError::BadHeaderOffset {
            path: path.to_owned(),
            offset: header_offset,
        });
    }

    if reader.u32(pe_start, "PE signature")? != PE_SIGNATURE {
        return Err(LookupError::BadPeSignature {
            path: path.to_owned(),
        });
    }

    // COFF file header: machine, section count, timestamp + symbol table (skipped),
    // optional header size, characteristics (skipped)
    let machine = reader.u16(pe_start + 4, "file header")?;
    let section_count = reader.u16(pe_start + 6, "file header")?;
    let optional_header_size = reader.u16(pe_start + 20, "file header")?;
    let optional_start = pe_start + FILE_HEADER_SIZE;

    let magic = reader.u16(optional_start, "optional header")?;
    let layout =
        OptionalHeaderLayout::from_magic(magic).ok_or_else(|| LookupError::UnsupportedMagic {
            path: path.to_owned(),
            magic,
        })?;

    if (optional_header_size as usize) < layout.min_optional_header_size() {
        return Err(LookupError::OptionalHeaderTooSmall {
            path: path.to_owned(),
            size: optional_header_size,
        });
    }

    let import_entry =
        optional_start + layout.data_directories_offset() + DATA_DIRECTORY_ENTRY_SIZE;
    let import_directory = DataDirectory {
        rva: reader.u32(import_entry, "data directories")?,
        size: reader.u32(import_entry + 4, "data directories")?,
    };

    let table_start = optional_start + optional_header_size as usize;
    let sections = (0..section_count as usize)
        .map(|i| {
            reader
                .view
                .try_read::<SectionDescriptor>(table_start + i * SECTION_DESCRIPTOR_SIZE)
                .map(SectionDescriptor::from_le)
                .ok_or_else(|| reader.truncated("section table"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HeaderFacts {
        machine,
        layout,
        import_directory,
        sections,
    })
}

/// Read a NUL-terminated module name at the given RVA
fn read_module_name(facts: &HeaderFacts, bytes: &[u8], rva: u32) -> Option<String> {
    let offset = facts.rva_to_offset(rva)?;
    let tail = bytes.get(offset..)?;
    let capped = &tail[..tail.len().min(MAX_MODULE_NAME_LEN)];
    let raw = capped.split(|&b| b == 0).next().unwrap_or(capped);
    let name = String::from_utf8_lossy(raw).trim().to_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn extract_imports(path: &Path, facts: &HeaderFacts, bytes: &[u8]) -> ModuleNames {
    let mut names = ModuleNames::default();
    let directory = facts.import_directory;
    if directory.rva == 0 || directory.size == 0 {
        return names;
    }
    let start = match facts.rva_to_offset(directory.rva) {
        Some(offset) if offset < bytes.len() => offset,
        _ => {
            debug!(
                "{}: import directory RVA {:#x} is not mapped to the file",
                path.display(),
                directory.rva
            );
            return names;
        }
    };

    let view = DataView::from(bytes);
    let end = start.saturating_add(directory.size as usize);
    let mut pos = start;
    while pos < end {
        let descriptor = match view.try_read::<ImportDescriptor>(pos) {
            Some(d) => d.from_le(),
            None => break,
        };
        if descriptor.is_terminator() {
            break;
        }
        if descriptor.name != 0 {
            match read_module_name(facts, bytes, descriptor.name) {
                Some(name) => names.insert(name),
                None => trace!(
                    "{}: skipping unreadable import name at RVA {:#x}",
                    path.display(),
                    descriptor.name
                ),
            }
        }
        pos += IMPORT_DESCRIPTOR_SIZE;
    }
    names
}

/// Case-insensitive set of module names that keeps the order of first insertion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleNames {
    names: Vec<String>,
}

impl ModuleNames {
    /// Add a name unless an equal one (ignoring ASCII case) is already present
    pub fn insert(&mut self, name: String) {
        if !self.contains(&name) {
            self.names.push(name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.names.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<'a> IntoIterator for &'a ModuleNames {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<S: Into<String>> FromIterator<S> for ModuleNames {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut names = Self::default();
        for n in iter {
            names.insert(n.into());
        }
        names
    }
}

/// What we know about an executable file after parsing its headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
    pub file_path: PathBuf,
    pub is_64_bit: bool,
    /// IMAGE_FILE_HEADER.Machine, informational only
    pub machine: u16,
    /// names of the DLLs listed in the import directory
    pub imported_modules: ModuleNames,
}

/// Parse an in-memory PE image; `path` is only used for error messages and the result
pub fn parse_bytes<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<BinaryInfo, LookupError> {
    let path = path.as_ref();
    let facts = decode_headers(path, bytes)?;
    let imported_modules = extract_imports(path, &facts, bytes);
    Ok(BinaryInfo {
        file_path: path.to_owned(),
        is_64_bit: facts.layout == OptionalHeaderLayout::Pe32Plus,
        machine: facts.machine,
        imported_modules,
    })
}

/// Read the file at the given path and list the DLLs it imports
pub fn parse<P: AsRef<Path>>(path: P) -> Result<BinaryInfo, LookupError> {
    let content = fs_err::read(path.as_ref())?;
    parse_bytes(path, &content)
}
