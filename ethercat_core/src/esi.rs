//! Namespace-agnostic ESI (EtherCAT Slave Information) XML decoder (§6,
//! component C6).
//!
//! Consumes an ESI XML file and yields a static [`EsiDescription`]: the
//! rx/tx PDO assignment, per-entry `(index, subindex, bit_length)` list, the
//! owning sync-manager index for each PDO, coarse feature-support flags, and
//! the device's identifying fields. Nothing downstream depends on the parser
//! itself — only on this returned description (§1).
//!
//! Grounded on the workspace's original `xml_decoder.py`: the same
//! `RxPdo`/`TxPdo` + `Entry` shape and the same heuristic feature flags,
//! extended here to also accept multiple encoded-integer spellings and to
//! select among multiple `<Device>` blocks the way a real ESI file (which
//! often describes a whole product family in one XML) requires.

use std::path::Path;

use roxmltree::{Document, Node};
use thiserror::Error;

/// Errors raised while decoding an ESI file.
#[derive(Debug, Error)]
pub enum EsiError {
    /// The file could not be read.
    #[error("failed to read ESI file {path}: {reason}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O failure reason.
        reason: String,
    },
    /// The file was not well-formed XML.
    #[error("failed to parse ESI XML: {0}")]
    Xml(String),
    /// No `<Device>` block matched the caller's vendor/product filter (or
    /// the file contained no device blocks at all).
    #[error("no matching device found in ESI file (vendor_id={vendor_id:?}, product_code={product_code:?})")]
    NoMatchingDevice {
        /// Vendor id filter that was applied, if any.
        vendor_id: Option<u32>,
        /// Product code filter that was applied, if any.
        product_code: Option<u32>,
    },
}

/// One `(index, subindex, bit_length)` entry inside a PDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoEntryDesc {
    /// Object dictionary index.
    pub index: u16,
    /// Object dictionary subindex.
    pub subindex: u8,
    /// Bit length of this entry.
    pub bit_length: u8,
}

/// One PDO (e.g. `0x1600`) and its ordered entry list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoDesc {
    /// PDO index (e.g. `0x1600` for a typical first RxPdo).
    pub index: u16,
    /// Owning sync-manager index, when present in the ESI file.
    pub sync_manager: Option<u8>,
    /// Ordered entries mapped into this PDO.
    pub entries: Vec<PdoEntryDesc>,
}

/// Coarse feature-support flags derived from which standard CiA-402 indices
/// appear in the decoded PDO entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupportFlags {
    /// Controlword (0x6040) mapped in an RxPdo.
    pub controlword: bool,
    /// Statusword (0x6041) mapped in a TxPdo.
    pub statusword: bool,
    /// Modes of operation (0x6060) mapped in an RxPdo.
    pub mode_command: bool,
    /// Modes of operation display (0x6061) mapped in a TxPdo.
    pub mode_display: bool,
    /// Target position (0x607A) mapped in an RxPdo (implies PP/CSP support).
    pub target_position: bool,
    /// Target velocity (0x60FF) mapped in an RxPdo (implies PV support).
    pub target_velocity: bool,
    /// Any touch-probe register (0x60B8/0x60B9/0x60BA/0x60BB/0x60BC) mapped.
    pub touch_probe: bool,
}

/// Identifying fields of the selected `<Device>` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Vendor id, from the ESI file's `<Vendor><Id>`.
    pub vendor_id: u32,
    /// Product code, from the device's `<Type ProductCode=.../>`.
    pub product_code: u32,
    /// Revision number, from the device's `<Type RevisionNo=.../>`.
    pub revision: u32,
    /// Friendly device name.
    pub name: String,
}

/// The static description yielded by decoding one ESI device block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsiDescription {
    /// Identifying fields of the selected device.
    pub identity: DeviceIdentity,
    /// Receive (outbound, master->slave) PDOs, in document order.
    pub rx_pdos: Vec<PdoDesc>,
    /// Transmit (inbound, slave->master) PDOs, in document order.
    pub tx_pdos: Vec<PdoDesc>,
    /// Coarse feature-support flags.
    pub supports: SupportFlags,
}

/// Parse an integer that may be spelled as decimal, `0x...`, `#x...`, or with
/// a trailing `h` (e.g. `1770h`). Namespace-agnostic ESI files in the wild
/// use all four forms depending on the authoring tool.
fn parse_esi_int(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("#x").or_else(|| text.strip_prefix("#X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = text.strip_suffix('h').or_else(|| text.strip_suffix('H')) {
        return i64::from_str_radix(hex, 16).ok();
    }
    text.parse::<i64>().ok()
}

fn child_text<'a, 'input: 'a>(node: &Node<'a, 'input>, local_name: &str) -> Option<&'input str> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name().eq_ignore_ascii_case(local_name))
        .and_then(|c| c.text())
}

fn child_int(node: &Node<'_, '_>, local_name: &str) -> Option<i64> {
    child_text(node, local_name).and_then(parse_esi_int)
}

fn attr_int(node: &Node<'_, '_>, local_name: &str) -> Option<i64> {
    node.attributes()
        .find(|a| a.name().eq_ignore_ascii_case(local_name))
        .and_then(|a| parse_esi_int(a.value()))
}

fn descendants_named<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    local_name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.descendants()
        .filter(move |n| n.is_element() && n.tag_name().name().eq_ignore_ascii_case(local_name))
}

fn parse_pdo_block(node: &Node<'_, '_>) -> PdoDesc {
    let index = child_int(node, "Index").unwrap_or(0) as u16;
    let sync_manager = attr_int(node, "Sm").map(|v| v as u8);
    let entries = node
        .children()
        .filter(|c| c.is_element() && c.tag_name().name().eq_ignore_ascii_case("Entry"))
        .filter_map(|entry| {
            let index = child_int(&entry, "Index")? as u16;
            let subindex = child_int(&entry, "SubIndex")
                .or_else(|| child_int(&entry, "Subindex"))
                .unwrap_or(0) as u8;
            let bit_length = child_int(&entry, "BitLen")
                .or_else(|| child_int(&entry, "BitLength"))
                .unwrap_or(0) as u8;
            Some(PdoEntryDesc { index, subindex, bit_length })
        })
        .collect();
    PdoDesc { index, sync_manager, entries }
}

fn compute_supports(rx_pdos: &[PdoDesc], tx_pdos: &[PdoDesc]) -> SupportFlags {
    let rx_has = |idx: u16| rx_pdos.iter().any(|p| p.entries.iter().any(|e| e.index == idx));
    let tx_has = |idx: u16| tx_pdos.iter().any(|p| p.entries.iter().any(|e| e.index == idx));
    let probe_indices = [0x60B8u16, 0x60B9, 0x60BA, 0x60BB, 0x60BC];
    SupportFlags {
        controlword: rx_has(0x6040),
        statusword: tx_has(0x6041),
        mode_command: rx_has(0x6060),
        mode_display: tx_has(0x6061),
        target_position: rx_has(0x607A),
        target_velocity: rx_has(0x60FF),
        touch_probe: probe_indices
            .iter()
            .any(|idx| rx_has(*idx) || tx_has(*idx)),
    }
}

/// Score a candidate `<Device>` block against the selection policy (§6):
/// prefer matching product code and revision, then visibility, then
/// non-zero product code.
fn device_score(
    device: &Node<'_, '_>,
    product_code: u32,
    revision: u32,
    wanted_product: Option<u32>,
    wanted_revision: Option<u32>,
) -> (bool, bool, bool, bool) {
    let product_matches = wanted_product.map(|p| p == product_code).unwrap_or(false);
    let revision_matches = product_matches
        && wanted_revision.map(|r| r == revision).unwrap_or(false);
    let hidden = attr_int(device, "Hide").map(|v| v != 0).unwrap_or(false)
        || child_text(device, "Hide").map(|v| v.trim() == "1").unwrap_or(false);
    (revision_matches, product_matches, !hidden, product_code != 0)
}

/// Decode an ESI XML file into a static [`EsiDescription`].
///
/// When the file describes multiple devices, `vendor_id`/`product_code`
/// filter the candidates; among remaining candidates the device selection
/// prefers (in order): matching product code and revision, then visible
/// (non-hidden) devices, then devices with a non-zero product code.
pub fn decode_esi_file(
    path: &Path,
    vendor_id: Option<u32>,
    product_code: Option<u32>,
    revision: Option<u32>,
) -> Result<EsiDescription, EsiError> {
    let content = std::fs::read_to_string(path).map_err(|e| EsiError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    decode_esi_str(&content, vendor_id, product_code, revision)
}

/// Decode an ESI document already read into memory. Split out from
/// [`decode_esi_file`] so tests can exercise the parser without touching disk.
pub fn decode_esi_str(
    content: &str,
    vendor_id_filter: Option<u32>,
    product_code_filter: Option<u32>,
    revision_filter: Option<u32>,
) -> Result<EsiDescription, EsiError> {
    let doc = Document::parse(content).map_err(|e| EsiError::Xml(e.to_string()))?;
    let root = doc.root_element();

    let file_vendor_id = descendants_named(root, "Vendor")
        .next()
        .and_then(|v| child_int(&v, "Id"))
        .map(|v| v as u32)
        .unwrap_or(0);

    let devices: Vec<Node> = descendants_named(root, "Device").collect();

    let mut best: Option<(Node, u32, u32)> = None;
    let mut best_rank = (false, false, false, false);
    for device in &devices {
        let type_node = device
            .children()
            .find(|c| c.is_element() && c.tag_name().name().eq_ignore_ascii_case("Type"));
        let product_code = type_node
            .as_ref()
            .and_then(|t| attr_int(t, "ProductCode"))
            .unwrap_or(0) as u32;
        let revision = type_node
            .as_ref()
            .and_then(|t| attr_int(t, "RevisionNo"))
            .unwrap_or(0) as u32;

        if let Some(wanted_vendor) = vendor_id_filter {
            if wanted_vendor != file_vendor_id {
                continue;
            }
        }
        if let Some(wanted_product) = product_code_filter {
            if wanted_product != product_code {
                continue;
            }
        }

        let rank = device_score(device, product_code, revision, product_code_filter, revision_filter);
        if best.is_none() || rank > best_rank {
            best = Some((*device, product_code, revision));
            best_rank = rank;
        }
    }

    let (device, product_code, revision) = best.ok_or(EsiError::NoMatchingDevice {
        vendor_id: vendor_id_filter,
        product_code: product_code_filter,
    })?;

    let name = child_text(&device, "Name").unwrap_or("unknown").to_string();

    let rx_pdos: Vec<PdoDesc> = descendants_named(device, "RxPdo")
        .map(|n| parse_pdo_block(&n))
        .collect();
    let tx_pdos: Vec<PdoDesc> = descendants_named(device, "TxPdo")
        .map(|n| parse_pdo_block(&n))
        .collect();
    let supports = compute_supports(&rx_pdos, &tx_pdos);

    Ok(EsiDescription {
        identity: DeviceIdentity {
            vendor_id: file_vendor_id,
            product_code,
            revision,
            name,
        },
        rx_pdos,
        tx_pdos,
        supports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <EtherCATInfo>
          <Vendor><Id>#x00000ab</Id></Vendor>
          <Descriptions>
            <Devices>
              <Device>
                <Type ProductCode="#x12345678" RevisionNo="#x00010000">ServoA</Type>
                <Name>Servo Drive A</Name>
                <RxPdo Sm="2">
                  <Index>#x1600</Index>
                  <Entry><Index>#x6040</Index><SubIndex>0</SubIndex><BitLen>16</BitLen></Entry>
                  <Entry><Index>#x607A</Index><SubIndex>0</SubIndex><BitLen>32</BitLen></Entry>
                </RxPdo>
                <TxPdo Sm="3">
                  <Index>#x1A00</Index>
                  <Entry><Index>#x6041</Index><SubIndex>0</SubIndex><BitLen>16</BitLen></Entry>
                  <Entry><Index>#x6064</Index><SubIndex>0</SubIndex><BitLen>32</BitLen></Entry>
                </TxPdo>
              </Device>
              <Device Hide="1">
                <Type ProductCode="999" RevisionNo="1">Hidden</Type>
                <Name>Hidden Device</Name>
              </Device>
            </Devices>
          </Descriptions>
        </EtherCATInfo>
    "#;

    #[test]
    fn decodes_identity_and_pdos() {
        let desc = decode_esi_str(SAMPLE, None, None, None).expect("decode");
        assert_eq!(desc.identity.vendor_id, 0xAB);
        assert_eq!(desc.identity.product_code, 0x1234_5678);
        assert_eq!(desc.rx_pdos.len(), 1);
        assert_eq!(desc.rx_pdos[0].index, 0x1600);
        assert_eq!(desc.rx_pdos[0].sync_manager, Some(2));
        assert_eq!(desc.rx_pdos[0].entries.len(), 2);
        assert_eq!(desc.tx_pdos[0].entries[0].index, 0x6041);
    }

    #[test]
    fn support_flags_detect_cia402_registers() {
        let desc = decode_esi_str(SAMPLE, None, None, None).unwrap();
        assert!(desc.supports.controlword);
        assert!(desc.supports.statusword);
        assert!(desc.supports.target_position);
        assert!(!desc.supports.target_velocity);
    }

    #[test]
    fn prefers_matching_product_code_over_hidden() {
        let desc = decode_esi_str(SAMPLE, None, Some(0x1234_5678), None).unwrap();
        assert_eq!(desc.identity.name, "Servo Drive A");
    }

    #[test]
    fn rejects_no_matching_device() {
        let err = decode_esi_str(SAMPLE, None, Some(0xDEAD_BEEF), None);
        assert!(matches!(err, Err(EsiError::NoMatchingDevice { .. })));
    }

    const MULTI_REVISION: &str = r#"
        <EtherCATInfo>
          <Vendor><Id>#x00000ab</Id></Vendor>
          <Descriptions>
            <Devices>
              <Device>
                <Type ProductCode="#x12345678" RevisionNo="#x00010000">ServoA rev1</Type>
                <Name>Servo Drive A rev1</Name>
              </Device>
              <Device>
                <Type ProductCode="#x12345678" RevisionNo="#x00020000">ServoA rev2</Type>
                <Name>Servo Drive A rev2</Name>
              </Device>
            </Devices>
          </Descriptions>
        </EtherCATInfo>
    "#;

    #[test]
    fn prefers_matching_revision_among_same_product_code() {
        let desc = decode_esi_str(MULTI_REVISION, None, Some(0x1234_5678), Some(0x0002_0000)).unwrap();
        assert_eq!(desc.identity.name, "Servo Drive A rev2");
        assert_eq!(desc.identity.revision, 0x0002_0000);
    }

    #[test]
    fn falls_back_to_first_product_match_when_revision_unspecified() {
        let desc = decode_esi_str(MULTI_REVISION, None, Some(0x1234_5678), None).unwrap();
        assert_eq!(desc.identity.name, "Servo Drive A rev1");
    }

    #[test]
    fn parses_all_integer_spellings() {
        assert_eq!(parse_esi_int("#x10"), Some(16));
        assert_eq!(parse_esi_int("0x10"), Some(16));
        assert_eq!(parse_esi_int("10h"), Some(16));
        assert_eq!(parse_esi_int("16"), Some(16));
    }
}
