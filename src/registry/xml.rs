// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The persistent exports file: `<cache-dir>/exports`, UTF-8 XML, no DTD.
//!
//! ```text
//! <exportlist format_version="1" version="N">
//!     <export uuid="UUID" type="bdev" path="PATH"/>
//!     <export uuid="UUID" type="iscsi" lun="N" filter_policy="ACCEPT">
//!         <filter iqn="PATTERN" policy="REJECT"/>
//!     </export>
//! </exportlist>
//! ```
//!
//! The parser is tolerant: a broken `<export>` is logged and skipped while
//! everything parsed before (and after) it stays. Structural problems of the
//! document itself fail the whole load.

use std::{
    fs,
    path::{Path, PathBuf},
};

use quick_xml::{
    Reader, Writer,
    events::{BytesDecl, BytesStart, Event, attributes::Attributes},
};
use tracing::{error, warn};

use crate::{
    errors::LumError,
    export::{
        export::Export, iqn::Iqn, iqn_filter::FilterPolicy, lun::Lun, uuid::ExaUuid,
    },
    registry::table::{AdmExport, EXPORTS_VERSION_DEFAULT, ExportTable},
};

/// The one format this code writes and accepts.
const EXPORTS_FILE_FORMAT_VERSION: u32 = 1;

/// File name inside the cache directory.
const EXPORTS_FILE_NAME: &str = "exports";

pub fn to_xml(table: &ExportTable) -> Result<String, LumError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
        .map_err(|_| LumError::XmlParse)?;

    let mut root = BytesStart::new("exportlist");
    root.push_attribute((
        "format_version",
        EXPORTS_FILE_FORMAT_VERSION.to_string().as_str(),
    ));
    root.push_attribute(("version", table.version().to_string().as_str()));
    writer
        .write_event(Event::Start(root))
        .map_err(|_| LumError::XmlParse)?;

    for adm in table.iter() {
        let export = adm.export();
        let mut elem = BytesStart::new("export");
        elem.push_attribute(("uuid", export.uuid().to_string().as_str()));

        if let Some(path) = export.bdev_path() {
            elem.push_attribute(("type", "bdev"));
            elem.push_attribute(("path", path));
            writer
                .write_event(Event::Empty(elem))
                .map_err(|_| LumError::XmlParse)?;
            continue;
        }

        let lun = export.iscsi_lun().expect("iscsi export");
        let policy = export.iscsi_filter_policy().expect("iscsi export");
        elem.push_attribute(("type", "iscsi"));
        elem.push_attribute(("lun", lun.to_string().as_str()));
        elem.push_attribute(("filter_policy", policy.to_string().as_str()));

        if export.iqn_filters_number() == 0 {
            writer
                .write_event(Event::Empty(elem))
                .map_err(|_| LumError::XmlParse)?;
            continue;
        }

        writer
            .write_event(Event::Start(elem))
            .map_err(|_| LumError::XmlParse)?;
        for i in 0..export.iqn_filters_number() {
            let filter = export.nth_iqn_filter(i).expect("bounded");
            let mut felem = BytesStart::new("filter");
            felem.push_attribute(("iqn", filter.pattern().as_str()));
            felem.push_attribute(("policy", filter.policy().to_string().as_str()));
            writer
                .write_event(Event::Empty(felem))
                .map_err(|_| LumError::XmlParse)?;
        }
        writer
            .write_event(Event::End(BytesStart::new("export").to_end()))
            .map_err(|_| LumError::XmlParse)?;
    }

    writer
        .write_event(Event::End(BytesStart::new("exportlist").to_end()))
        .map_err(|_| LumError::XmlParse)?;

    String::from_utf8(writer.into_inner()).map_err(|_| LumError::XmlParse)
}

fn attr(attrs: Attributes<'_>, name: &str) -> Option<String> {
    for a in attrs.flatten() {
        if a.key.as_ref() == name.as_bytes() {
            return a.unescape_value().ok().map(|v| v.into_owned());
        }
    }
    None
}

/// Attributes of an `<export>` element, parsed into a fresh description.
/// `None` means "skip this export", with the reason already logged.
fn parse_export_element(e: &BytesStart<'_>) -> Option<Export> {
    let s_uuid = attr(e.attributes(), "uuid")?;
    let Ok(uuid) = s_uuid.parse::<ExaUuid>() else {
        error!("invalid UUID, skipping export {s_uuid}");
        return None;
    };

    match attr(e.attributes(), "type").as_deref() {
        Some("bdev") => {
            let Some(path) = attr(e.attributes(), "path") else {
                error!("missing path, skipping export {uuid}");
                return None;
            };
            match Export::new_bdev(uuid, &path) {
                Ok(export) => Some(export),
                Err(err) => {
                    error!("invalid path, skipping export {uuid}: {err}");
                    None
                },
            }
        },
        Some("iscsi") => {
            let s_lun = attr(e.attributes(), "lun").unwrap_or_default();
            let Ok(lun) = s_lun.parse::<Lun>() else {
                error!("invalid lun {s_lun:?}, skipping export {uuid}");
                return None;
            };
            let s_policy = attr(e.attributes(), "filter_policy").unwrap_or_default();
            let Ok(policy) = s_policy.parse::<FilterPolicy>() else {
                error!("invalid filter_policy {s_policy:?}, skipping export {uuid}");
                return None;
            };
            Some(Export::new_iscsi(uuid, lun, policy))
        },
        other => {
            error!(
                "invalid type {}, skipping export {uuid}",
                other.unwrap_or("NULL")
            );
            None
        },
    }
}

fn parse_filter_element(export: &mut Export, e: &BytesStart<'_>) -> Result<(), ()> {
    let pattern = attr(e.attributes(), "iqn")
        .and_then(|s| Iqn::new(&s).ok())
        .ok_or(())?;
    let policy = attr(e.attributes(), "policy")
        .and_then(|s| s.parse::<FilterPolicy>().ok())
        .ok_or(())?;
    if let Err(err) = export.add_iqn_filter(pattern.clone(), policy) {
        error!("failed adding filter {pattern}: {err}");
        return Err(());
    }
    Ok(())
}

/// Parse a document into the table. Returns `XmlParse` on structural
/// failures; individually broken exports are skipped and only logged.
pub fn parse_from_xml(table: &mut ExportTable, contents: &str) -> Result<(), LumError> {
    let mut reader = Reader::from_str(contents);
    reader.config_mut().trim_text(true);

    let mut seen_root = false;
    // (export being filled, still healthy)
    let mut current: Option<(Export, bool)> = None;
    let mut skipped = 0usize;

    loop {
        match reader.read_event() {
            Err(e) => {
                error!("exports file parse error: {e}");
                return Err(LumError::XmlParse);
            },
            Ok(Event::Eof) => break,
            Ok(Event::Decl(_)) | Ok(Event::Text(_)) | Ok(Event::Comment(_)) => {},
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.name().as_ref() == b"exportlist" =>
            {
                let format_version = match attr(e.attributes(), "format_version") {
                    // files predating the field are format 1
                    None => EXPORTS_FILE_FORMAT_VERSION,
                    Some(s) => s.parse::<u32>().map_err(|_| LumError::XmlParse)?,
                };
                if format_version != EXPORTS_FILE_FORMAT_VERSION {
                    error!(
                        "failed parsing exports file: expected version {}, got {}",
                        EXPORTS_FILE_FORMAT_VERSION, format_version
                    );
                    return Err(LumError::XmlParse);
                }
                let version = attr(e.attributes(), "version")
                    .ok_or(LumError::XmlParse)?
                    .parse::<u64>()
                    .map_err(|_| LumError::XmlParse)?;
                table.set_version(version);
                seen_root = true;
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"export" => {
                if !seen_root {
                    return Err(LumError::XmlParse);
                }
                match parse_export_element(&e) {
                    Some(export) => insert_parsed(table, export, &mut skipped),
                    None => skipped += 1,
                }
            },
            Ok(Event::Start(e)) if e.name().as_ref() == b"export" => {
                if !seen_root {
                    return Err(LumError::XmlParse);
                }
                match parse_export_element(&e) {
                    Some(export) => current = Some((export, true)),
                    None => {
                        current = None;
                        skipped += 1;
                    },
                }
            },
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if e.name().as_ref() == b"filter" =>
            {
                if let Some((export, healthy)) = current.as_mut()
                    && *healthy
                    && parse_filter_element(export, &e).is_err()
                {
                    error!(
                        "failed parsing IQN filter, skipping export {}",
                        export.uuid()
                    );
                    *healthy = false;
                }
            },
            Ok(Event::End(e)) if e.name().as_ref() == b"export" => {
                match current.take() {
                    Some((export, true)) => insert_parsed(table, export, &mut skipped),
                    Some((_, false)) => skipped += 1,
                    None => {},
                }
            },
            Ok(Event::End(_)) => {},
            Ok(_) => {},
        }
    }

    if !seen_root {
        return Err(LumError::XmlParse);
    }
    if skipped > 0 {
        warn!(
            "exports file partially parsed: {} exports loaded, {skipped} skipped",
            table.number()
        );
    }
    Ok(())
}

fn insert_parsed(table: &mut ExportTable, export: Export, skipped: &mut usize) {
    let uuid = *export.uuid();
    if let Err(e) = table.insert(AdmExport::new(export)) {
        error!("cannot keep export {uuid}: {e}");
        *skipped += 1;
    }
}

/// Handle on the on-disk exports file.
#[derive(Debug, Clone)]
pub struct ExportsFile {
    path: PathBuf,
}

impl ExportsFile {
    pub fn new(cache_dir: &Path) -> Self {
        ExportsFile {
            path: cache_dir.join(EXPORTS_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file into a cleared table. A missing file is an empty
    /// catalog; a parse failure leaves the table cleared.
    pub fn load(&self, table: &mut ExportTable) -> Result<(), LumError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *table = ExportTable::new();
                return Ok(());
            },
            Err(e) => {
                error!("failed reading {}: {e}", self.path.display());
                return Err(LumError::ReadFile);
            },
        };

        *table = ExportTable::new();
        parse_from_xml(table, &contents).inspect_err(|_| {
            warn!(
                "failed parsing {}: only {} exports were successfully parsed",
                self.path.display(),
                table.number()
            );
            *table = ExportTable::new();
        })
    }

    /// Write the table out; the file reflects the last committed version.
    pub fn store(&self, table: &ExportTable) -> Result<(), LumError> {
        let contents = to_xml(table)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                error!("cannot create {}: {e}", dir.display());
                LumError::ReadFile
            })?;
        }
        fs::write(&self.path, contents).map_err(|e| {
            error!("failed writing {}: {e}", self.path.display());
            LumError::ReadFile
        })
    }

    pub fn remove(&self) -> bool {
        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) => e.kind() == std::io::ErrorKind::NotFound,
        }
    }
}
