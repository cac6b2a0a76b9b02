use std::str::from_utf8;

const HEADER_LEN: usize = 12;
const TYPE_OPT: u16 = 41;

/// 快速解析结果，尽可能零拷贝
pub struct QuickQuery<'a> {
    pub tx_id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
}

/// 仅解析 DNS 头部和第一个 Query，避免 Message::from_bytes 的全量解析
/// buf: 用于存储归一化（小写）域名的缓冲区，建议至少 256 字节
pub fn parse_quick<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<QuickQuery<'a>> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    if read_u16(packet, 4)? == 0 {
        return None;
    }

    let mut buf_pos = 0;
    let mut current_pos = HEADER_LEN;
    let mut end_pos = None;
    let mut max_jumps = 5;

    loop {
        let len = *packet.get(current_pos)?;
        if len == 0 {
            end_pos.get_or_insert(current_pos + 1);
            break;
        }
        if (len & 0xC0) == 0xC0 {
            let low = *packet.get(current_pos + 1)?;
            end_pos.get_or_insert(current_pos + 2);
            current_pos = ((((len as u16) & 0x3F) << 8) | low as u16) as usize;
            max_jumps -= 1;
            if max_jumps == 0 {
                return None;
            }
            continue;
        }

        let label_len = len as usize;
        current_pos += 1;
        let label = packet.get(current_pos..current_pos + label_len)?;
        if buf_pos > 0 {
            *buf.get_mut(buf_pos)? = b'.';
            buf_pos += 1;
        }
        // Labels are ASCII or punycode; lowercasing bytes leaves anything else untouched.
        for &b in label {
            *buf.get_mut(buf_pos)? = b.to_ascii_lowercase();
            buf_pos += 1;
        }
        current_pos += label_len;
    }

    let pos = end_pos?;
    let qtype = read_u16(packet, pos)?;
    let qclass = read_u16(packet, pos + 2)?;
    let qname = from_utf8(&buf[..buf_pos]).ok()?;

    Some(QuickQuery {
        tx_id,
        qname,
        qtype,
        qclass,
    })
}

/// 提取 OPT 伪记录中的全部 EDNS0 选项 / Collect every option of the OPT pseudo-RR.
///
/// Malformed or truncated packets yield whatever was read before the damage.
pub fn edns_options(packet: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    let Some(counts) = section_counts(packet) else {
        return out;
    };
    let [qd, an, ns, ar] = counts;

    let mut pos = HEADER_LEN;
    for _ in 0..qd {
        let Some(next) = skip_name(packet, pos) else {
            return out;
        };
        pos = next + 4;
    }
    for _ in 0..(an as usize + ns as usize) {
        let Some(next) = skip_record(packet, pos) else {
            return out;
        };
        pos = next;
    }

    for _ in 0..ar {
        let Some(name_end) = skip_name(packet, pos) else {
            return out;
        };
        let (Some(rtype), Some(rdlen)) = (read_u16(packet, name_end), read_u16(packet, name_end + 8))
        else {
            return out;
        };
        let rdata_start = name_end + 10;
        let rdata_end = rdata_start + rdlen as usize;
        if rtype == TYPE_OPT {
            let Some(rdata) = packet.get(rdata_start..rdata_end) else {
                return out;
            };
            let mut opt_pos = 0;
            while opt_pos + 4 <= rdata.len() {
                let code = u16::from_be_bytes([rdata[opt_pos], rdata[opt_pos + 1]]);
                let len = u16::from_be_bytes([rdata[opt_pos + 2], rdata[opt_pos + 3]]) as usize;
                let Some(data) = rdata.get(opt_pos + 4..opt_pos + 4 + len) else {
                    break;
                };
                out.push((code, data));
                opt_pos += 4 + len;
            }
            return out;
        }
        pos = rdata_end;
    }
    out
}

/// Whether the header has the TC bit set.
pub fn is_truncated(packet: &[u8]) -> bool {
    packet.len() >= 3 && packet[2] & 0x02 != 0
}

fn section_counts(packet: &[u8]) -> Option<[u16; 4]> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    Some([
        read_u16(packet, 4)?,
        read_u16(packet, 6)?,
        read_u16(packet, 8)?,
        read_u16(packet, 10)?,
    ])
}

#[inline]
fn read_u16(packet: &[u8], pos: usize) -> Option<u16> {
    let b = packet.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Returns the offset right after the (possibly compressed) name at `pos`.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if (len & 0xC0) == 0xC0 {
            packet.get(pos + 1)?;
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

fn skip_record(packet: &[u8], pos: usize) -> Option<usize> {
    let name_end = skip_name(packet, pos)?;
    let rdlen = read_u16(packet, name_end + 8)? as usize;
    let end = name_end + 10 + rdlen;
    if end > packet.len() {
        return None;
    }
    Some(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Edns, Message, Query};
    use hickory_proto::rr::rdata::opt::EdnsOption;
    use hickory_proto::rr::{Name, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::str::FromStr;

    fn query_bytes(qname: &str, options: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.add_query(Query::query(Name::from_str(qname).unwrap(), RecordType::A));
        if !options.is_empty() {
            let mut edns = Edns::new();
            for (code, data) in options {
                edns.options_mut()
                    .insert(EdnsOption::Unknown(*code, data.clone()));
            }
            msg.set_edns(edns);
        }
        msg.to_bytes().unwrap()
    }

    #[test]
    fn parse_quick_lowercases_qname() {
        let packet = query_bytes("WWW.Example.COM.", &[]);
        let mut buf = [0u8; 256];
        let q = parse_quick(&packet, &mut buf).expect("parse");
        assert_eq!(q.tx_id, 0x1234);
        assert_eq!(q.qname, "www.example.com");
        assert_eq!(q.qtype, 1);
        assert_eq!(q.qclass, 1);
    }

    #[test]
    fn parse_quick_rejects_short_packets() {
        let mut buf = [0u8; 256];
        assert!(parse_quick(&[0u8; 5], &mut buf).is_none());
    }

    #[test]
    fn edns_options_reads_opt_record() {
        let packet = query_bytes(
            "example.com.",
            &[(0xfff0, vec![0xaa, 0xbb, 0xcc, 0xdd]), (0xfff1, b"client-7".to_vec())],
        );
        let mut opts = edns_options(&packet);
        opts.sort_by_key(|(code, _)| *code);
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[0], (0xfff0, &[0xaa, 0xbb, 0xcc, 0xdd][..]));
        assert_eq!(opts[1], (0xfff1, &b"client-7"[..]));
    }

    #[test]
    fn edns_options_without_opt_is_empty() {
        let packet = query_bytes("example.com.", &[]);
        assert!(edns_options(&packet).is_empty());
    }

    #[test]
    fn edns_options_survives_truncated_packet() {
        let packet = query_bytes("example.com.", &[(0xfff0, vec![1, 2, 3, 4])]);
        let cut = &packet[..packet.len() - 3];
        assert!(edns_options(cut).is_empty());
    }
}
