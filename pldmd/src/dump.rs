// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Advisory PDR dump.
//!
//! Serialises a terminus's raw PDR store to a text file keyed by TID,
//! iterating record types in ascending order.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use pldmd_platform::pdr::pdr_type;
use pldmd_platform::terminus::PlatformTerminus;

/// Write the raw PDR store of `terminus` under `dir`.
///
/// Returns the created file path.
pub fn dump_pdrs(
    terminus: &PlatformTerminus,
    dir: &Path,
) -> std::io::Result<PathBuf> {
    if terminus.repo.is_empty() {
        info!("TID {}: PDR repo empty", terminus.tid);
    }

    let path = dir.join(format!("pldm_pdr_dump_{}.txt", terminus.tid));
    let mut file = File::create(&path)?;

    for ty in pdr_type::TERMINUS_LOCATOR..pdr_type::OEM {
        for (_, record) in terminus.repo.records_of_type(ty) {
            let mut s = String::new();
            let _ = writeln!(s, "PDR Type: {ty}");
            let _ = writeln!(s, "Length: {}", record.len());
            let _ = write!(s, "Data:");
            for b in record {
                let _ = write!(s, " 0x{b:02x}");
            }
            writeln!(file, "{s}")?;
        }
    }

    info!("TID {}: PDR dump written to {}", terminus.tid, path.display());
    Ok(path)
}
