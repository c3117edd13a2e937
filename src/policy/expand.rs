//! ASN-range and RFC 2622 prefix expansion.
//!
//! Configuration documents may write ASNs as `A-B` ranges and prefixes with
//! RFC 2622 length qualifiers (`^+`, `^-`, `^n`, `^n-m`). Both are expanded
//! into concrete values before anything reaches the prefix index.

use super::AsnExpr;
use crate::bgp::Asn;
use anyhow::{anyhow, bail, Result};
use ipnet::IpNet;
use std::collections::BTreeSet;

/// Upper bound on the number of prefixes a single expression may expand to.
/// An inclusive qualifier on a short prefix enumerates exponentially many
/// sub-prefixes; past this point the document is rejected as invalid rather
/// than exhausting memory.
const MAX_EXPANSION: usize = 65_536;

/// Expand a list of ASN expressions into a flat, deduplicated set.
pub fn expand_asns(exprs: &[AsnExpr]) -> Result<BTreeSet<Asn>> {
    let mut out = BTreeSet::new();
    for expr in exprs {
        match expr {
            AsnExpr::Asn(asn) => {
                out.insert(*asn);
            }
            AsnExpr::Expr(text) => {
                let (start, end) = parse_asn_range(text)?;
                out.extend(start..=end);
            }
        }
    }
    Ok(out)
}

/// Parse `A` or `A-B` into an inclusive range.
fn parse_asn_range(text: &str) -> Result<(Asn, Asn)> {
    let text = text.trim();
    match text.split_once('-') {
        None => {
            let asn: Asn = text
                .parse()
                .map_err(|_| anyhow!("invalid ASN '{text}'"))?;
            Ok((asn, asn))
        }
        Some((start, end)) => {
            let start: Asn = start
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid ASN range start in '{text}'"))?;
            let end: Asn = end
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid ASN range end in '{text}'"))?;
            if start > end {
                bail!("empty ASN range '{text}'");
            }
            if (end - start) as usize >= MAX_EXPANSION {
                bail!("ASN range '{text}' expands to more than {MAX_EXPANSION} entries");
            }
            Ok((start, end))
        }
    }
}

/// Expand an RFC 2622 prefix expression into canonical prefixes.
///
/// Supported qualifiers, applied to a base CIDR:
/// - none: the prefix itself
/// - `^+`: the prefix and every more-specific sub-prefix
/// - `^-`: every strictly more-specific sub-prefix
/// - `^n`: every sub-prefix of length exactly `n`
/// - `^n-m`: every sub-prefix with length in `n..=m`
///
/// Lengths are bounded by the address family (32 for IPv4, 128 for IPv6).
pub fn expand_rfc2622(expr: &str) -> Result<Vec<IpNet>> {
    let expr = expr.trim();
    let (base, qualifier) = match expr.split_once('^') {
        None => (expr, None),
        Some((base, qualifier)) => (base, Some(qualifier)),
    };

    let net: IpNet = base
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid prefix '{base}'"))?;
    let net = net.trunc();
    let max_len = net.max_prefix_len();

    let (start_len, end_len) = match qualifier {
        None => return Ok(vec![net]),
        Some("+") => (net.prefix_len(), max_len),
        Some("-") => {
            if net.prefix_len() == max_len {
                bail!("'{expr}': host prefix has no more-specifics");
            }
            (net.prefix_len() + 1, max_len)
        }
        Some(range) => parse_length_range(expr, range, net.prefix_len(), max_len)?,
    };

    let mut out = Vec::new();
    for len in start_len..=end_len {
        // 2^(len - prefix_len) sub-prefixes at this length
        let bits = u32::from(len - net.prefix_len());
        let count = 1usize.checked_shl(bits).unwrap_or(usize::MAX);
        if out.len().saturating_add(count) > MAX_EXPANSION {
            bail!("'{expr}' expands to more than {MAX_EXPANSION} prefixes");
        }
        for subnet in net
            .subnets(len)
            .map_err(|_| anyhow!("invalid sub-prefix length {len} in '{expr}'"))?
        {
            out.push(subnet);
        }
    }
    Ok(out)
}

fn parse_length_range(
    expr: &str,
    range: &str,
    prefix_len: u8,
    max_len: u8,
) -> Result<(u8, u8)> {
    let (start, end) = match range.split_once('-') {
        None => {
            let n: u8 = range
                .parse()
                .map_err(|_| anyhow!("invalid length qualifier in '{expr}'"))?;
            (n, n)
        }
        Some((start, end)) => {
            let start: u8 = start
                .parse()
                .map_err(|_| anyhow!("invalid length qualifier in '{expr}'"))?;
            let end: u8 = end
                .parse()
                .map_err(|_| anyhow!("invalid length qualifier in '{expr}'"))?;
            (start, end)
        }
    };
    if start < prefix_len || end > max_len || start > end {
        bail!(
            "length qualifier out of bounds in '{expr}' (allowed {}..={})",
            prefix_len,
            max_len
        );
    }
    Ok((start, end))
}
