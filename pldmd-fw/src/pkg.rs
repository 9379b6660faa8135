// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update: package parsing.
 *
 * Copyright (c) 2025 Code Construct
 */

//! Firmware update package parsing.
//!
//! The header is parsed up-front; component image bytes stay in the file
//! and are read on demand as the firmware device requests them.

use nom::{
    bytes::complete::take,
    combinator::{all_consuming, map, map_res},
    multi::{count, length_count},
    number::complete::{le_u16, le_u32, le_u8},
    sequence::tuple,
    Finish, IResult,
};
use std::io::{BufReader, Read};
use std::os::unix::fs::FileExt;
use thiserror::Error;
use uuid::{uuid, Uuid};

const PKG_UUID_1_0_X: Uuid = uuid!("f018878c-cb7d-4943-9800-a02f059aca02");
const PKG_UUID_1_1_X: Uuid = uuid!("1244d264-8d7d-4718-a030-fc8a56587d5a");

use crate::{
    parse_string, parse_string_adjacent, ComponentClassification, Descriptor,
    DescriptorString, DeviceIdentifiers,
};

type VResult<I, O> = IResult<I, O>;

/// Errors from package parsing and reading.
#[derive(Error, Debug)]
pub enum PldmPackageError {
    /// Underlying file IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed package contents
    #[error("PLDM package format error: {0}")]
    Format(String),
}

impl PldmPackageError {
    fn new_format(s: &str) -> Self {
        Self::Format(s.into())
    }
}

type Result<T> = std::result::Result<T, PldmPackageError>;

/// Bitmap of package components applicable to one device.
#[derive(Debug)]
pub struct ComponentBitmap {
    n_bits: usize,
    bits: Vec<u8>,
}

impl<'a> ComponentBitmap {
    /// Parse a bitmap of `component_bits` bits.
    pub fn parse(
        component_bits: u16,
    ) -> impl FnMut(&'a [u8]) -> VResult<&'a [u8], Self> {
        let bytes = component_bits.div_ceil(8);
        map(take(bytes), move |b: &[u8]| ComponentBitmap {
            n_bits: component_bits as usize,
            bits: b.to_vec(),
        })
    }

    /// Whether component `i` is applicable.
    pub fn bit(&self, i: usize) -> bool {
        let idx = i / 8;
        let offt = i % 8;
        self.bits[idx] & (1 << offt) != 0
    }

    /// Indices of the applicable components.
    pub fn as_index_vec(&self) -> Vec<usize> {
        (0..self.n_bits).filter(|i| self.bit(*i)).collect()
    }
}

/// One device ID record of the package.
#[derive(Debug)]
pub struct PackageDevice {
    /// Descriptors identifying the device
    pub ids: DeviceIdentifiers,
    /// Update option flags
    pub option_flags: u32,
    /// Component image set version
    pub version: DescriptorString,
    /// Components applicable to this device
    pub components: ComponentBitmap,
    /// Firmware device package data, served on GetPackageData
    pub package_data: Vec<u8>,
}

impl PackageDevice {
    /// Parse one device ID record.
    pub fn parse(buf: &[u8], component_bits: u16) -> VResult<&[u8], Self> {
        let (
            r,
            (len, desc_count, flags, set_ver_type, set_ver_len, pkg_data_len),
        ) = tuple((le_u16, le_u8, le_u32, le_u8, le_u8, le_u16))(buf)?;

        // split the record's length bytes off
        let (rest, r) = take(len - 11)(r)?;

        let (r, components) = ComponentBitmap::parse(component_bits)(r)?;
        let (r, set_ver) = parse_string(set_ver_type, set_ver_len)(r)?;
        let (r, ids) = count(Descriptor::parse, desc_count as usize)(r)?;
        let (_, pkg_data) = all_consuming(take(pkg_data_len))(r)?;

        let pkgdev = PackageDevice {
            ids: DeviceIdentifiers { ids },
            option_flags: flags,
            version: set_ver,
            components,
            package_data: pkg_data.to_vec(),
        };

        Ok((rest, pkgdev))
    }
}

/// One component image of the package.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct PackageComponent {
    pub classification: ComponentClassification,
    pub identifier: u16,
    pub comparison_stamp: u32,
    pub options: u16,
    pub activation_method: u16,
    pub file_offset: usize,
    pub file_size: usize,
    pub version: DescriptorString,
}

impl PackageComponent {
    /// Parse one component image information record.
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (
            r,
            (
                classification,
                identifier,
                comparison_stamp,
                options,
                activation_method,
                file_offset,
                file_size,
                version,
            ),
        ) = tuple((
            le_u16,
            le_u16,
            le_u32,
            le_u16,
            le_u16,
            le_u32,
            le_u32,
            parse_string_adjacent,
        ))(buf)?;

        let c = PackageComponent {
            classification: classification.into(),
            identifier,
            comparison_stamp,
            options,
            activation_method,
            file_offset: file_offset as usize,
            file_size: file_size as usize,
            version,
        };
        Ok((r, c))
    }
}

/// A parsed firmware update package.
#[derive(Debug)]
pub struct Package {
    /// Package format UUID
    pub identifier: Uuid,
    /// Package version string
    pub version: DescriptorString,
    /// Device ID records
    pub devices: Vec<PackageDevice>,
    /// Component image records
    pub components: Vec<PackageComponent>,
    file: std::fs::File,
}

impl Package {
    /// Parse a package header from an open file.
    pub fn parse(file: std::fs::File) -> Result<Self> {
        // just enough length to retrieve the header size field, after which
        // we can parse the rest of the header.
        const HDR_INIT_SIZE: usize = 16 + 1 + 2;

        let mut reader = BufReader::new(&file);
        let mut init = [0u8; HDR_INIT_SIZE];
        reader.read_exact(&mut init)?;

        let (_, (identifier, _hdr_format, hdr_size)) =
            all_consuming(tuple((
                map_res(
                    take::<_, _, nom::error::Error<_>>(16usize),
                    Uuid::from_slice,
                ),
                le_u8,
                le_u16,
            )))(&init)
            .map_err(|_| PldmPackageError::new_format("can't parse header"))?;

        let mut hdr_usize = hdr_size as usize;
        if hdr_usize < HDR_INIT_SIZE {
            return Err(PldmPackageError::new_format("invalid header size"));
        }

        hdr_usize -= HDR_INIT_SIZE;

        let mut buf = vec![0u8; hdr_usize];
        reader.read_exact(&mut buf).map_err(|_| {
            PldmPackageError::new_format(
                "reported header size is larger than file",
            )
        })?;

        let (r, (_release_date_time, component_bitmap_length, version)) =
            tuple((take(13usize), le_u16, parse_string_adjacent))(
                buf.as_slice(),
            )
            .finish()
            .map_err(|_| PldmPackageError::new_format("can't parse header"))?;

        let f = |d| PackageDevice::parse(d, component_bitmap_length);
        let (r, devices) = length_count(le_u8, f)(r)
            .finish()
            .map_err(|_| PldmPackageError::new_format("can't parse devices"))?;

        /* this is the first divergence in package format versions; the
         * downstream device identification area is only present in 1.1.x
         */
        let r = match identifier {
            PKG_UUID_1_0_X => r,
            PKG_UUID_1_1_X => {
                let (r, _downstream_devices) =
                    length_count(le_u8, f)(r).finish().map_err(|_| {
                        PldmPackageError::new_format(
                            "can't parse downstream devices",
                        )
                    })?;
                r
            }
            _ => {
                return Err(PldmPackageError::new_format(&format!(
                    "unknown package UUID {}",
                    identifier
                )))
            }
        };

        let f = |d| PackageComponent::parse(d);
        let (_, components) =
            length_count(le_u16, f)(r).finish().map_err(|_| {
                PldmPackageError::new_format("can't parse components")
            })?;

        Ok(Package {
            identifier,
            version,
            devices,
            components,
            file,
        })
    }

    /// Read component image bytes at `offset` within the component.
    pub fn read_component(
        &self,
        component: &PackageComponent,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let file_offset = offset as u64 + component.file_offset as u64;
        Ok(self.file.read_at(buf, file_offset)?)
    }

    /// Device ID records whose descriptors match `ids`, by index.
    pub fn matching_devices(&self, ids: &DeviceIdentifiers) -> Vec<usize> {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| &d.ids == ids)
            .map(|(n, _)| n)
            .collect()
    }

    /// Total bytes of the components applicable to device record `index`.
    pub fn updatable_image_size(&self, index: usize) -> usize {
        let Some(dev) = self.devices.get(index) else {
            return 0;
        };
        dev.components
            .as_index_vec()
            .iter()
            .filter_map(|i| self.components.get(*i))
            .map(|c| c.file_size)
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod test_pkg {
    //! In-memory package builder shared by the crate's tests.

    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    pub struct TestComponent {
        pub identifier: u16,
        pub image: Vec<u8>,
    }

    /// Serialise a minimal 1.0.x package with one device ID record covering
    /// every component.
    pub fn build(
        devices: &[&DeviceIdentifiers],
        components: &[TestComponent],
    ) -> Package {
        let mut hdr: Vec<u8> = Vec::new();
        hdr.extend_from_slice(PKG_UUID_1_0_X.as_bytes());
        hdr.push(0x01); // header format revision
        hdr.extend_from_slice(&0u16.to_le_bytes()); // size, patched below
        hdr.extend_from_slice(&[0u8; 13]); // release date time
        let bitmap_bits = 8u16;
        hdr.extend_from_slice(&bitmap_bits.to_le_bytes());
        hdr.push(0x01); // version string type
        hdr.push(4); // version string length
        hdr.extend_from_slice(b"pkg1");

        // device ID records
        hdr.push(devices.len() as u8);
        for ids in devices {
            let mut desc: Vec<u8> = Vec::new();
            for d in &ids.ids {
                match d {
                    Descriptor::PciVid(v) => {
                        desc.extend_from_slice(&0x0000u16.to_le_bytes());
                        desc.extend_from_slice(&2u16.to_le_bytes());
                        desc.extend_from_slice(&v.to_le_bytes());
                    }
                    Descriptor::Iana(v) => {
                        desc.extend_from_slice(&0x0001u16.to_le_bytes());
                        desc.extend_from_slice(&4u16.to_le_bytes());
                        desc.extend_from_slice(&v.to_le_bytes());
                    }
                    _ => unimplemented!("test descriptor type"),
                }
            }

            let applicable = (1u8 << components.len()) - 1;
            let set_ver = b"dev1";
            // record length covers the whole record including this field
            let record_len = 11 + 1 + set_ver.len() + desc.len();
            hdr.extend_from_slice(&(record_len as u16).to_le_bytes());
            hdr.push(ids.ids.len() as u8); // descriptor count
            hdr.extend_from_slice(&0u32.to_le_bytes()); // option flags
            hdr.push(0x01); // set version string type
            hdr.push(set_ver.len() as u8);
            hdr.extend_from_slice(&0u16.to_le_bytes()); // pkg data len
            hdr.push(applicable); // component bitmap, 8 bits
            hdr.extend_from_slice(set_ver);
            hdr.extend_from_slice(&desc);
        }

        // component image information; offsets are filled after the header
        // size is known
        let comp_info_len: usize = components
            .iter()
            .map(|_| 2 + 2 + 4 + 2 + 2 + 4 + 4 + 1 + 1 + 2)
            .sum::<usize>()
            + 2;
        let hdr_size = hdr.len() + comp_info_len;

        hdr.extend_from_slice(&(components.len() as u16).to_le_bytes());
        let mut offset = hdr_size;
        for c in components {
            hdr.extend_from_slice(&0x000au16.to_le_bytes()); // classification
            hdr.extend_from_slice(&c.identifier.to_le_bytes());
            hdr.extend_from_slice(&1u32.to_le_bytes()); // comparison stamp
            hdr.extend_from_slice(&0u16.to_le_bytes()); // options
            hdr.extend_from_slice(&0u16.to_le_bytes()); // activation method
            hdr.extend_from_slice(&(offset as u32).to_le_bytes());
            hdr.extend_from_slice(&(c.image.len() as u32).to_le_bytes());
            hdr.push(0x01); // version string type
            hdr.push(2);
            hdr.extend_from_slice(b"v1");
            offset += c.image.len();
        }
        assert_eq!(hdr.len(), hdr_size);

        // patch the header size field
        hdr[17..19].copy_from_slice(&(hdr_size as u16).to_le_bytes());

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&hdr).unwrap();
        for c in components {
            file.write_all(&c.image).unwrap();
        }
        file.seek(SeekFrom::Start(0)).unwrap();

        Package::parse(file).unwrap()
    }
}
