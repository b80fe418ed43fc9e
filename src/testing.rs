//! Synthetic PE images for the unit tests

use std::path::{Path, PathBuf};

pub(crate) const PE_HEADER_START: usize = 0x80;
pub(crate) const OPTIONAL_HEADER_START: usize = PE_HEADER_START + 24;
pub(crate) const IMPORT_SECTION_FILE_OFFSET: usize = 0x200;
const IMPORT_SECTION_RVA: u32 = 0x1000;
const IMPORT_SECTION_SIZE: usize = 0x200;

/// Minimal PE file with a single `.idata` section holding the import directory
pub(crate) struct PeBuilder {
    is_64_bit: bool,
    imports: Vec<String>,
    directory_rva: Option<u32>,
    directory_size: Option<u32>,
}

impl PeBuilder {
    pub(crate) fn new(is_64_bit: bool) -> Self {
        Self {
            is_64_bit,
            imports: Vec::new(),
            directory_rva: None,
            directory_size: None,
        }
    }

    pub(crate) fn import(mut self, name: &str) -> Self {
        self.imports.push(name.to_owned());
        self
    }

    pub(crate) fn imports(mut self, names: &[&str]) -> Self {
        self.imports.extend(names.iter().map(|&n| n.to_owned()));
        self
    }

    pub(crate) fn import_directory_rva(mut self, rva: u32) -> Self {
        self.directory_rva = Some(rva);
        self
    }

    pub(crate) fn import_directory_size(mut self, size: u32) -> Self {
        self.directory_size = Some(size);
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; IMPORT_SECTION_FILE_OFFSET + IMPORT_SECTION_SIZE];
        let put16 = |image: &mut Vec<u8>, at: usize, v: u16| {
            image[at..at + 2].copy_from_slice(&v.to_le_bytes())
        };
        let put32 = |image: &mut Vec<u8>, at: usize, v: u32| {
            image[at..at + 4].copy_from_slice(&v.to_le_bytes())
        };

        // DOS header
        image[0..2].copy_from_slice(b"MZ");
        put32(&mut image, 0x3C, PE_HEADER_START as u32);

        // COFF file header
        let (machine, magic, optional_size, directories) = if self.is_64_bit {
            (0x8664u16, 0x20Bu16, 0xF0u16, 0x70usize)
        } else {
            (0x14C, 0x10B, 0xE0, 0x60)
        };
        image[PE_HEADER_START..PE_HEADER_START + 4].copy_from_slice(b"PE\0\0");
        put16(&mut image, PE_HEADER_START + 4, machine);
        put16(&mut image, PE_HEADER_START + 6, 1);
        put16(&mut image, PE_HEADER_START + 20, optional_size);
        put16(&mut image, PE_HEADER_START + 22, 0x2022);

        // optional header: magic and the import data directory entry
        put16(&mut image, OPTIONAL_HEADER_START, magic);
        let descriptors_size = (self.imports.len() as u32 + 1) * 20;
        if !self.imports.is_empty() || self.directory_rva.is_some() {
            let entry = OPTIONAL_HEADER_START + directories + 8;
            put32(
                &mut image,
                entry,
                self.directory_rva.unwrap_or(IMPORT_SECTION_RVA),
            );
            put32(
                &mut image,
                entry + 4,
                self.directory_size.unwrap_or(descriptors_size),
            );
        }

        // section table
        let section = OPTIONAL_HEADER_START + optional_size as usize;
        image[section..section + 8].copy_from_slice(b".idata\0\0");
        put32(&mut image, section + 8, IMPORT_SECTION_SIZE as u32);
        put32(&mut image, section + 12, IMPORT_SECTION_RVA);
        put32(&mut image, section + 16, IMPORT_SECTION_SIZE as u32);
        put32(&mut image, section + 20, IMPORT_SECTION_FILE_OFFSET as u32);
        put32(&mut image, section + 36, 0xC000_0040);

        // import descriptors, followed by the null descriptor and the names
        let mut name_offset = IMPORT_SECTION_FILE_OFFSET + descriptors_size as usize;
        for (i, name) in self.imports.iter().enumerate() {
            let descriptor = IMPORT_SECTION_FILE_OFFSET + i * 20;
            let name_rva = IMPORT_SECTION_RVA + (name_offset - IMPORT_SECTION_FILE_OFFSET) as u32;
            put32(&mut image, descriptor, 0x1180);
            put32(&mut image, descriptor + 12, name_rva);
            put32(&mut image, descriptor + 16, 0x1190);
            assert!(
                name_offset + name.len() < image.len(),
                "too many imports for the synthetic section"
            );
            image[name_offset..name_offset + name.len()].copy_from_slice(name.as_bytes());
            name_offset += name.len() + 1;
        }

        image
    }

    pub(crate) fn write(&self, dir: &Path, filename: &str) -> std::io::Result<PathBuf> {
        let path = dir.join(filename);
        fs_err::write(&path, self.build())?;
        Ok(path)
    }
}
