use super::*;

/// Coinbase data pulled out of a verbosity-2 block: the input script and the
/// payout addresses ordered by descending summed output value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CoinbaseData {
    pub(crate) script_sig: String,
    pub(crate) addresses: Vec<String>,
}

/// Rebuilds the raw coinbase hex the way a miner would assemble it:
/// `coinbase1 || extranonce1 || 00 * extranonce2_length || coinbase2`.
pub(crate) fn reconstruct_hex(
    coinbase1: &str,
    extranonce1: &str,
    extranonce2_length: i64,
    coinbase2: &str,
) -> String {
    let extranonce2_length = usize::try_from(extranonce2_length).unwrap_or_else(|_| {
        warn!("Negative extranonce2_length {extranonce2_length}, substituting 0");
        0
    });

    format!(
        "{coinbase1}{extranonce1}{}{coinbase2}",
        "00".repeat(extranonce2_length)
    )
}

pub(crate) fn decode_transaction(raw_hex: &str) -> Result<Transaction> {
    let bytes = hex::decode(raw_hex).context("invalid coinbase hex")?;
    consensus::encode::deserialize(&bytes).context("coinbase does not parse as a transaction")
}

/// BIP34 height: byte 0 is the push length, the next `n` bytes are the
/// little-endian height. Pushes longer than four bytes are nonsense and
/// decode to 0.
pub(crate) fn height_from_script(script: &[u8]) -> u64 {
    let Some(&n) = script.first() else {
        return 0;
    };

    let n = usize::from(n);

    if n == 0 || n > 4 || script.len() < 1 + n {
        return 0;
    }

    LittleEndian::read_uint(&script[1..1 + n], n)
}

/// Height claimed by a template, recovered from its reconstructed coinbase.
/// Anything that fails to parse degrades to 0 rather than dropping the
/// template.
pub(crate) fn template_height(
    coinbase1: &str,
    extranonce1: &str,
    extranonce2_length: i64,
    coinbase2: &str,
) -> u64 {
    let raw = reconstruct_hex(coinbase1, extranonce1, extranonce2_length, coinbase2);

    match decode_transaction(&raw) {
        Ok(transaction) => transaction
            .input
            .first()
            .map(|input| height_from_script(input.script_sig.as_bytes()))
            .unwrap_or_default(),
        Err(err) => {
            warn!("Failed to decode reconstructed coinbase: {err:#}");
            0
        }
    }
}

pub(crate) fn total_output_sats(transaction: &Transaction) -> u64 {
    transaction
        .output
        .iter()
        .map(|output| output.value.to_sat())
        .sum()
}

/// Best-effort printable rendering of the input script, used for tag
/// matching. Lossy UTF-8 with newlines stripped.
pub(crate) fn script_sig_text(script_hex: &str) -> String {
    match hex::decode(script_hex) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).replace('\n', ""),
        Err(_) => String::new(),
    }
}

/// Extracts the coinbase script and value-ordered payout addresses from a
/// `getblock <hash> 2` response. The script lives under `scriptSig.hex` on
/// legacy nodes and under `coinbase` on modern ones; one of the two must be
/// present.
pub(crate) fn extract_coinbase(block: &Value) -> Result<CoinbaseData> {
    let coinbase_tx = block
        .get("tx")
        .and_then(Value::as_array)
        .and_then(|transactions| transactions.first())
        .context("block has no transactions")?;

    let vin0 = coinbase_tx
        .get("vin")
        .and_then(Value::as_array)
        .and_then(|inputs| inputs.first())
        .context("coinbase has no inputs")?;

    let script_sig = vin0
        .pointer("/scriptSig/hex")
        .and_then(Value::as_str)
        .or_else(|| vin0.get("coinbase").and_then(Value::as_str))
        .context("no coinbase script found")?
        .to_string();

    let outputs = coinbase_tx
        .get("vout")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut order = Vec::new();
    let mut totals: HashMap<String, f64> = HashMap::new();

    for output in &outputs {
        let value = output.get("value").and_then(Value::as_f64).unwrap_or(0.0);

        let Some(script_pub_key) = output.get("scriptPubKey") else {
            continue;
        };

        let mut addresses = Vec::new();

        if let Some(plural) = script_pub_key.get("addresses").and_then(Value::as_array) {
            addresses.extend(plural.iter().filter_map(Value::as_str));
        } else if let Some(single) = script_pub_key.get("address").and_then(Value::as_str) {
            addresses.push(single);
        }

        for address in addresses {
            if !totals.contains_key(address) {
                order.push(address.to_string());
            }
            *totals.entry(address.to_string()).or_default() += value;
        }
    }

    // stable sort keeps first-appearance order for equal values
    order.sort_by(|a, b| {
        totals
            .get(b)
            .copied()
            .unwrap_or_default()
            .partial_cmp(&totals.get(a).copied().unwrap_or_default())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(CoinbaseData {
        script_sig,
        addresses: order,
    })
}

/// Decodes hex into bytes, tolerating trailing garbage the way a permissive
/// scanner must: parsing stops at the first invalid pair.
fn lenient_hex(script_hex: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(script_hex.len() / 2);

    for chunk in script_hex.as_bytes().chunks(2) {
        let Ok(pair) = std::str::from_utf8(chunk) else {
            break;
        };
        let Ok(byte) = u8::from_str_radix(pair, 16) else {
            break;
        };
        bytes.push(byte);
    }

    bytes
}

/// Parses the names DATUM embeds in an OCEAN coinbase tag region. The region
/// starts after the height push, carries its own length byte (0x4c means
/// OP_PUSHDATA1, so the real length follows), and separates names with 0x0f.
pub(crate) fn datum_template_creator_names(script_hex: &str) -> Vec<String> {
    let bytes = lenient_hex(script_hex);

    let Some(&height_push) = bytes.first() else {
        return Vec::new();
    };

    let mut length_index = 1 + usize::from(height_push);

    let Some(&length) = bytes.get(length_index) else {
        return Vec::new();
    };

    let mut tag_length = length;

    if tag_length == 0x4c {
        length_index += 1;
        match bytes.get(length_index) {
            Some(&length) => tag_length = length,
            None => return Vec::new(),
        }
    }

    let tag_start = length_index + 1;

    if tag_start >= bytes.len() {
        return Vec::new();
    }

    let tag_end = (tag_start + usize::from(tag_length)).min(bytes.len());

    bytes[tag_start..tag_end]
        .split(|&byte| byte == 0x0f)
        .map(|part| {
            part.iter()
                .filter(|&&byte| byte != 0x00)
                .map(|&byte| byte as char)
                .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
                .collect::<String>()
                .trim()
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// The last embedded name that is neither an OCEAN nor a DATUM marker.
pub(crate) fn datum_template_creator(script_hex: &str) -> Option<String> {
    datum_template_creator_names(script_hex)
        .into_iter()
        .rev()
        .find(|name| {
            let lowered = name.to_lowercase();
            !lowered.contains("ocean") && !lowered.contains("datum")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COINBASE1: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff20020862062f503253482f04b8864e5008";
    const COINBASE2: &str = "072f736c7573682f000000000100f2052a010000001976a914d23fcdf86f7e756a64a7a9688ef9903327048ed988ac00000000";
    const EXTRANONCE1: &str = "08000002";

    #[test]
    fn reconstruction_and_height() {
        let raw = reconstruct_hex(COINBASE1, EXTRANONCE1, 4, COINBASE2);
        let transaction = decode_transaction(&raw).unwrap();

        assert_eq!(
            height_from_script(transaction.input[0].script_sig.as_bytes()),
            25096
        );
        assert_eq!(total_output_sats(&transaction), 5_000_000_000);
    }

    #[test]
    fn reconstruction_concatenates_in_order() {
        assert_eq!(reconstruct_hex("aa", "bb", 2, "cc"), "aabb0000cc");
        assert_eq!(reconstruct_hex("aa", "", 0, "cc"), "aacc");
        assert_eq!(reconstruct_hex("", "", 8, ""), "00".repeat(8));
    }

    #[test]
    fn negative_extranonce2_length_substitutes_zero() {
        assert_eq!(reconstruct_hex("aa", "bb", -3, "cc"), "aabbcc");
    }

    #[test]
    fn height_push_bounds() {
        assert_eq!(height_from_script(&[]), 0);
        assert_eq!(height_from_script(&[0x00]), 0);
        assert_eq!(height_from_script(&[0x01, 0x2a]), 42);
        assert_eq!(height_from_script(&[0x02, 0x08, 0x62]), 25096);
        assert_eq!(
            height_from_script(&[0x03, 0xe0, 0x75, 0x0d, 0xff]),
            0x0d75e0
        );
        assert_eq!(
            height_from_script(&[0x04, 0x01, 0x02, 0x03, 0x04]),
            0x04030201
        );
        // pushes longer than four bytes decode to 0
        assert_eq!(height_from_script(&[0x05, 1, 2, 3, 4, 5]), 0);
        // truncated push decodes to 0
        assert_eq!(height_from_script(&[0x04, 1, 2]), 0);
    }

    #[test]
    fn unparseable_template_height_is_zero() {
        assert_eq!(template_height("not hex", "", 0, ""), 0);
        assert_eq!(template_height("00", "", 0, "11"), 0);
    }

    #[test]
    fn script_text_strips_newlines() {
        let script_hex = hex::encode(b"/Foundry USA Pool\n/");
        assert_eq!(script_sig_text(&script_hex), "/Foundry USA Pool/");
        assert_eq!(script_sig_text("zz"), "");
    }

    #[test]
    fn extract_coinbase_legacy_addresses() {
        let block = json!({
            "tx": [{
                "vin": [{"scriptSig": {"hex": "03e0750d"}}],
                "vout": [
                    {"value": 0.5, "scriptPubKey": {"addresses": ["addr_small"]}},
                    {"value": 6.25, "scriptPubKey": {"addresses": ["addr_big"]}}
                ]
            }]
        });

        let coinbase = extract_coinbase(&block).unwrap();

        assert_eq!(coinbase.script_sig, "03e0750d");
        assert_eq!(coinbase.addresses, vec!["addr_big", "addr_small"]);
    }

    #[test]
    fn extract_coinbase_modern_fields() {
        let block = json!({
            "tx": [{
                "vin": [{"coinbase": "03e0750d"}],
                "vout": [
                    {"value": 1.0, "scriptPubKey": {"address": "addr_a"}},
                    {"value": 2.0, "scriptPubKey": {"address": "addr_b"}},
                    {"value": 1.5, "scriptPubKey": {"address": "addr_a"}}
                ]
            }]
        });

        let coinbase = extract_coinbase(&block).unwrap();

        // addr_a accumulates 2.5 across two outputs and outranks addr_b
        assert_eq!(coinbase.addresses, vec!["addr_a", "addr_b"]);
    }

    #[test]
    fn extract_coinbase_ties_keep_first_appearance() {
        let block = json!({
            "tx": [{
                "vin": [{"coinbase": "00"}],
                "vout": [
                    {"value": 1.0, "scriptPubKey": {"address": "first"}},
                    {"value": 1.0, "scriptPubKey": {"address": "second"}}
                ]
            }]
        });

        let coinbase = extract_coinbase(&block).unwrap();

        assert_eq!(coinbase.addresses, vec!["first", "second"]);
    }

    #[test]
    fn extract_coinbase_requires_a_script() {
        let block = json!({
            "tx": [{
                "vin": [{"sequence": 0}],
                "vout": []
            }]
        });

        assert!(extract_coinbase(&block).is_err());
    }

    fn datum_script(names: &[&str], pushdata1: bool) -> String {
        let mut tag = Vec::new();
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                tag.push(0x0f);
            }
            tag.extend_from_slice(name.as_bytes());
        }

        let mut script = vec![0x03, 0xe0, 0x75, 0x0d];
        if pushdata1 {
            script.push(0x4c);
        }
        script.push(u8::try_from(tag.len()).unwrap());
        script.extend_from_slice(&tag);
        hex::encode(script)
    }

    #[test]
    fn datum_names_split_on_separator() {
        let script = datum_script(&["OCEAN", "DATUM", "Bitaxe Open"], false);

        assert_eq!(
            datum_template_creator_names(&script),
            vec!["OCEAN", "DATUM", "Bitaxe Open"]
        );
        assert_eq!(
            datum_template_creator(&script),
            Some("Bitaxe Open".to_string())
        );
    }

    #[test]
    fn datum_names_behind_pushdata1() {
        let script = datum_script(&["OCEANxDATUM", "solo rig 9"], true);

        assert_eq!(
            datum_template_creator(&script),
            Some("solo rig 9".to_string())
        );
    }

    #[test]
    fn datum_markers_are_never_creators() {
        let script = datum_script(&["OCEAN", "datum gateway"], false);

        assert_eq!(datum_template_creator(&script), None);
    }

    #[test]
    fn datum_tolerates_truncation_and_bad_hex() {
        assert!(datum_template_creator_names("").is_empty());
        assert!(datum_template_creator_names("ff").is_empty());
        // length byte promises more than the script holds
        let script = hex::encode([0x01, 0x2a, 0x20, b'X']);
        assert_eq!(datum_template_creator_names(&script), vec!["X"]);
    }
}
