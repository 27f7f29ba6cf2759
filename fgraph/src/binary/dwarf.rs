//! Subprogram address ranges from DWARF
//!
//! Only `DW_TAG_subprogram` entries with a concrete `DW_AT_low_pc` are
//! collected. `DW_AT_high_pc` is either an absolute address or a length
//! relative to `low_pc`, depending on its form.

use std::borrow::Cow;
use std::collections::HashMap;
use std::rc::Rc;

use gimli::{AttributeValue, EndianRcSlice, Reader as _, RunTimeEndian};
use object::{Object, ObjectSection};

use super::AddressRange;

/// Subprogram ranges keyed by linkage name (falling back to `DW_AT_name`)
pub type SubprogramMap = HashMap<String, Vec<AddressRange>>;

/// Walk every compilation unit and collect subprogram ranges
///
/// # Errors
/// Returns an error if the debug sections are present but malformed
pub fn load_subprograms(file: &object::File<'_>) -> Result<SubprogramMap, gimli::Error> {
    let endian = if file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

    let load_section = |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
        let data = file
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok(EndianRcSlice::new(Rc::from(&*data), endian))
    };

    let dwarf = gimli::Dwarf::load(&load_section)?;
    let mut subprograms = SubprogramMap::new();

    let mut units = dwarf.units();
    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != gimli::DW_TAG_subprogram {
                continue;
            }

            let name_attr = match entry.attr_value(gimli::DW_AT_linkage_name)? {
                Some(value) => Some(value),
                None => entry.attr_value(gimli::DW_AT_name)?,
            };
            let Some(name_attr) = name_attr else {
                continue;
            };
            let name = dwarf.attr_string(&unit, name_attr)?.to_string_lossy()?.into_owned();

            let Some(low_attr) = entry.attr_value(gimli::DW_AT_low_pc)? else {
                continue;
            };
            let Some(low) = dwarf.attr_address(&unit, low_attr)? else {
                continue;
            };

            let high = match entry.attr_value(gimli::DW_AT_high_pc)? {
                Some(AttributeValue::Udata(length)) => low.checked_add(length),
                Some(value) => match dwarf.attr_address(&unit, value.clone())? {
                    Some(addr) => Some(addr),
                    None => value.udata_value().and_then(|length| low.checked_add(length)),
                },
                None => None,
            };
            let Some(high) = high else {
                continue;
            };

            subprograms.entry(name).or_default().push(AddressRange { low, high });
        }
    }

    Ok(subprograms)
}
