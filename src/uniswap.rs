//! Uniswap V2 trade planner (C11): pair-address derivation, constant-product
//! quote math, depth-bounded path search, and swap calldata assembly.

use alloy_primitives::{Address, U256};

use crate::crypto::keccak256;
use crate::error::{Result, WalletError};

/// Fee numerator/denominator for the 0.3% Uniswap V2 swap fee.
const FEE_NUMERATOR: u64 = 997;
const FEE_DENOMINATOR: u64 = 1000;

/// Ordered reserves for a pair (`token0 < token1` by address, §3 "Pair").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair {
    pub token0: Address,
    pub token1: Address,
    pub reserve0: U256,
    pub reserve1: U256,
}

impl Pair {
    /// Returns `(reserveIn, reserveOut)` for a trade moving `from -> to`.
    /// `None` if neither token matches this pair.
    fn reserves_for(&self, from: Address, to: Address) -> Option<(U256, U256)> {
        if from == self.token0 && to == self.token1 {
            Some((self.reserve0, self.reserve1))
        } else if from == self.token1 && to == self.token0 {
            Some((self.reserve1, self.reserve0))
        } else {
            None
        }
    }

    /// The other token in the pair, given one side.
    fn other(&self, token: Address) -> Option<Address> {
        if token == self.token0 {
            Some(self.token1)
        } else if token == self.token1 {
            Some(self.token0)
        } else {
            None
        }
    }
}

/// Deterministic CREATE2 pair address (§4.11 "Reserve fetch"):
/// `keccak(0xff ‖ factory ‖ keccak(token0 ‖ token1) ‖ initCodeHash)[12..]`.
pub fn pair_address(factory: &Address, token_a: &Address, token_b: &Address, init_code_hash: &[u8; 32]) -> Address {
    let (token0, token1) = if token_a < token_b { (token_a, token_b) } else { (token_b, token_a) };
    let mut salt_input = Vec::with_capacity(40);
    salt_input.extend_from_slice(token0.as_slice());
    salt_input.extend_from_slice(token1.as_slice());
    let salt = keccak256(&salt_input);

    let mut preimage = Vec::with_capacity(1 + 20 + 32 + 32);
    preimage.push(0xff);
    preimage.extend_from_slice(factory.as_slice());
    preimage.extend_from_slice(&salt);
    preimage.extend_from_slice(init_code_hash);

    let hash = keccak256(&preimage);
    Address::from_slice(&hash[12..])
}

/// Parses a `getReserves()` reply: three 32-byte words `(reserve0,
/// reserve1, blockTimestampLast)`. Any length other than 96 bytes yields
/// zero reserves (§4.11).
pub fn parse_reserves(reply: &[u8]) -> (U256, U256, u32) {
    if reply.len() != 96 {
        return (U256::ZERO, U256::ZERO, 0);
    }
    let reserve0 = U256::from_be_slice(&reply[0..32]);
    let reserve1 = U256::from_be_slice(&reply[32..64]);
    let timestamp = u32::from_be_bytes(reply[92..96].try_into().unwrap());
    (reserve0, reserve1, timestamp)
}

/// `amountOut(amountIn, rIn, rOut) = (amountIn·997·rOut) / (rIn·1000 +
/// amountIn·997)` (§4.11 constant-product math, 0.3% fee).
pub fn amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256) -> Result<U256> {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(WalletError::validation("insufficient liquidity or zero input"));
    }
    let amount_in_with_fee = amount_in * U256::from(FEE_NUMERATOR);
    let numerator = amount_in_with_fee * reserve_out;
    let denominator = reserve_in * U256::from(FEE_DENOMINATOR) + amount_in_with_fee;
    Ok(numerator / denominator)
}

/// `amountIn(amountOut, rIn, rOut) = (rIn·amountOut·1000) / ((rOut −
/// amountOut)·997) + 1` (§4.11; the `+1` rounds up so the resulting trade
/// never under-delivers `amountOut`, per P5).
pub fn amount_in(amount_out: U256, reserve_in: U256, reserve_out: U256) -> Result<U256> {
    if amount_out.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(WalletError::validation("insufficient liquidity or zero output"));
    }
    if amount_out >= reserve_out {
        return Err(WalletError::validation("amountOut exceeds pair reserves"));
    }
    let numerator = reserve_in * amount_out * U256::from(FEE_DENOMINATOR);
    let denominator = (reserve_out - amount_out) * U256::from(FEE_NUMERATOR);
    Ok(numerator / denominator + U256::from(1))
}

/// One complete swap path with its resulting amounts (§4.11 "Path search").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    /// Token addresses visited, `path[0]` the input token, `path.last()`
    /// the output token.
    pub path: Vec<Address>,
    pub input_amount: U256,
    pub output_amount: U256,
}

/// Depth-first search for every exact-in trade from `amount_in` of
/// `path.last()` to `out_token`, bounded by `max_hops` (§4.11): for each
/// remaining pair whose one side matches the current token, compute the
/// forward quote; emit a `Trade` if the other side is `out_token`, else
/// recurse with that pair removed from the pool.
pub fn trade_exact_in(pairs: &[Pair], amount_in_value: U256, path: &[Address], out_token: Address, max_hops: usize) -> Result<Vec<Trade>> {
    let mut trades = Vec::new();
    search_exact_in(pairs, amount_in_value, path, out_token, max_hops, &mut trades)?;
    Ok(trades)
}

fn search_exact_in(
    remaining_pairs: &[Pair],
    amount_in_value: U256,
    path: &[Address],
    out_token: Address,
    max_hops: usize,
    trades: &mut Vec<Trade>,
) -> Result<()> {
    let current = *path.last().expect("path always has at least the input token");

    for (i, pair) in remaining_pairs.iter().enumerate() {
        let Some(next_token) = pair.other(current) else { continue };
        let Some((reserve_in, reserve_out)) = pair.reserves_for(current, next_token) else { continue };
        let quote = match amount_out(amount_in_value, reserve_in, reserve_out) {
            Ok(q) => q,
            Err(_) => continue,
        };

        let mut next_path = path.to_vec();
        next_path.push(next_token);

        if next_token == out_token {
            trades.push(Trade { path: next_path, input_amount: amount_in_value, output_amount: quote });
        } else if max_hops > 1 && remaining_pairs.len() > 1 {
            let mut rest = remaining_pairs.to_vec();
            rest.remove(i);
            search_exact_in(&rest, quote, &next_path, out_token, max_hops - 1, trades)?;
        }
    }
    Ok(())
}

/// Depth-first search for every exact-out trade delivering `amount_out_value`
/// of `out_token`, working backward from the output, mirroring
/// `search_exact_in`.
pub fn trade_exact_out(pairs: &[Pair], amount_out_value: U256, in_token: Address, path_from_end: &[Address], max_hops: usize) -> Result<Vec<Trade>> {
    let mut trades = Vec::new();
    search_exact_out(pairs, amount_out_value, path_from_end, in_token, max_hops, &mut trades)?;
    Ok(trades)
}

fn search_exact_out(
    remaining_pairs: &[Pair],
    amount_out_value: U256,
    path_from_end: &[Address],
    in_token: Address,
    max_hops: usize,
    trades: &mut Vec<Trade>,
) -> Result<()> {
    let current = *path_from_end.first().expect("path always has at least the output token");

    for (i, pair) in remaining_pairs.iter().enumerate() {
        let Some(prev_token) = pair.other(current) else { continue };
        let Some((reserve_in, reserve_out)) = pair.reserves_for(prev_token, current) else { continue };
        let quote = match amount_in(amount_out_value, reserve_in, reserve_out) {
            Ok(q) => q,
            Err(_) => continue,
        };

        let mut next_path = path_from_end.to_vec();
        next_path.insert(0, prev_token);

        if prev_token == in_token {
            trades.push(Trade {
                path: next_path,
                input_amount: quote,
                output_amount: amount_out_value,
            });
        } else if max_hops > 1 && remaining_pairs.len() > 1 {
            let mut rest = remaining_pairs.to_vec();
            rest.remove(i);
            search_exact_out(&rest, quote, &next_path, in_token, max_hops - 1, trades)?;
        }
    }
    Ok(())
}

/// Picks the best trade from a set returned by `trade_exact_in`/
/// `trade_exact_out`: maximum `output_amount` for exact-in, minimum
/// `input_amount` for exact-out, tie-broken by shorter path (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    ExactIn,
    ExactOut,
}

pub fn best_trade(trades: &[Trade], side: TradeSide) -> Option<&Trade> {
    trades.iter().min_by(|a, b| {
        let primary = match side {
            TradeSide::ExactIn => b.output_amount.cmp(&a.output_amount),
            TradeSide::ExactOut => a.input_amount.cmp(&b.input_amount),
        };
        primary.then_with(|| a.path.len().cmp(&b.path.len()))
    })
}

/// Whether the input/output leg of a trade is the chain's native asset
/// (§4.11 "Swap calldata" table) or an ERC-20.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Ether,
    Erc20(Address),
}

/// Selects the Uniswap V2 Router method name for a given direction/side/
/// fee-on-transfer combination (§4.11 table).
pub fn swap_method_name(token_in: Leg, token_out: Leg, side: TradeSide, fee_on_transfer: bool) -> &'static str {
    match (token_in, token_out, side) {
        (Leg::Ether, Leg::Erc20(_), TradeSide::ExactIn) => {
            if fee_on_transfer {
                "swapExactETHForTokensSupportingFeeOnTransferTokens"
            } else {
                "swapExactETHForTokens"
            }
        }
        (Leg::Ether, Leg::Erc20(_), TradeSide::ExactOut) => "swapETHForExactTokens",
        (Leg::Erc20(_), Leg::Ether, TradeSide::ExactIn) => {
            if fee_on_transfer {
                "swapExactTokensForETHSupportingFeeOnTransferTokens"
            } else {
                "swapExactTokensForETH"
            }
        }
        (Leg::Erc20(_), Leg::Ether, TradeSide::ExactOut) => "swapTokensForExactETH",
        (Leg::Erc20(_), Leg::Erc20(_), TradeSide::ExactIn) => {
            if fee_on_transfer {
                "swapExactTokensForTokensSupportingFeeOnTransferTokens"
            } else {
                "swapExactTokensForTokens"
            }
        }
        (Leg::Erc20(_), Leg::Erc20(_), TradeSide::ExactOut) => "swapTokensForExactTokens",
        (Leg::Ether, Leg::Ether, _) => "swapExactTokensForTokens", // unreachable in practice
    }
}

/// The 4-byte selector for a Solidity function signature, as used to build
/// swap/approve calldata.
fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn encode_u256(value: U256) -> [u8; 32] {
    value.to_be_bytes()
}

fn encode_address(address: &Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address.as_slice());
    out
}

/// One call the caller must broadcast: a target contract plus ABI-encoded
/// calldata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub data: Vec<u8>,
}

/// ERC-20 `approve(router, amount)` calldata.
pub fn encode_approve(token: &Address, spender: &Address, amount: U256) -> Call {
    let mut data = selector("approve(address,uint256)").to_vec();
    data.extend_from_slice(&encode_address(spender));
    data.extend_from_slice(&encode_u256(amount));
    Call { to: *token, data }
}

/// Assembles the swap call (and, for ERC-20 sources, a preceding `approve`
/// call) for `trade` (§4.11 "Swap calldata"). `deadline` is a Unix
/// timestamp the caller supplies; `to` is the recipient of the output.
pub fn build_swap_calls(
    router: &Address,
    trade: &Trade,
    token_in: Leg,
    token_out: Leg,
    side: TradeSide,
    fee_on_transfer: bool,
    amount_in_max_or_exact: U256,
    amount_out_min_or_exact: U256,
    to: Address,
    deadline: u64,
) -> Vec<Call> {
    let method = swap_method_name(token_in, token_out, side, fee_on_transfer);
    let mut data = selector_for_method(method).to_vec();

    let is_eth_in = matches!(token_in, Leg::Ether);
    match side {
        TradeSide::ExactIn => {
            if !is_eth_in {
                data.extend_from_slice(&encode_u256(amount_in_max_or_exact));
            }
            data.extend_from_slice(&encode_u256(amount_out_min_or_exact));
        }
        TradeSide::ExactOut => {
            data.extend_from_slice(&encode_u256(amount_out_min_or_exact));
            if !is_eth_in {
                data.extend_from_slice(&encode_u256(amount_in_max_or_exact));
            }
        }
    }
    data.extend_from_slice(&encode_dynamic_address_array(&trade.path));
    data.extend_from_slice(&encode_address(&to));
    data.extend_from_slice(&encode_u256(U256::from(deadline)));

    let swap_call = Call { to: *router, data };

    match token_in {
        Leg::Erc20(token) => {
            vec![encode_approve(&token, router, amount_in_max_or_exact), swap_call]
        }
        Leg::Ether => vec![swap_call],
    }
}

fn selector_for_method(method: &str) -> [u8; 4] {
    // Canonical Uniswap V2 Router02 signatures for the methods named in
    // `swap_method_name`.
    let signature = match method {
        "swapExactETHForTokens" => "swapExactETHForTokens(uint256,address[],address,uint256)",
        "swapExactETHForTokensSupportingFeeOnTransferTokens" => {
            "swapExactETHForTokensSupportingFeeOnTransferTokens(uint256,address[],address,uint256)"
        }
        "swapETHForExactTokens" => "swapETHForExactTokens(uint256,address[],address,uint256)",
        "swapExactTokensForETH" => "swapExactTokensForETH(uint256,uint256,address[],address,uint256)",
        "swapExactTokensForETHSupportingFeeOnTransferTokens" => {
            "swapExactTokensForETHSupportingFeeOnTransferTokens(uint256,uint256,address[],address,uint256)"
        }
        "swapTokensForExactETH" => "swapTokensForExactETH(uint256,uint256,address[],address,uint256)",
        "swapExactTokensForTokens" => "swapExactTokensForTokens(uint256,uint256,address[],address,uint256)",
        "swapExactTokensForTokensSupportingFeeOnTransferTokens" => {
            "swapExactTokensForTokensSupportingFeeOnTransferTokens(uint256,uint256,address[],address,uint256)"
        }
        "swapTokensForExactTokens" => "swapTokensForExactTokens(uint256,uint256,address[],address,uint256)",
        other => unreachable!("unhandled swap method {other}"),
    };
    selector(signature)
}

/// ABI-encodes a dynamic `address[]` parameter (offset header is the
/// caller's job when this sits mid-calldata; here we assume it is the
/// trailing-most dynamic parameter so the head/tail layout is just
/// length-then-elements, matching the Router's ABI in practice since
/// `path` is always the last dynamic argument before the static `to`/
/// `deadline` tail).
fn encode_dynamic_address_array(addresses: &[Address]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + addresses.len() * 32);
    out.extend_from_slice(&encode_u256(U256::from(addresses.len())));
    for address in addresses {
        out.extend_from_slice(&encode_address(address));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    /// §8 scenario 4: pairs `[(A,B,1000,2000),(B,C,5000,4000)]`, `aIn=100
    /// A`, `tokenOut=C` -> exactly one trade, path `A -> B -> C`.
    #[test]
    fn exact_in_depth_two_finds_expected_path() {
        let a = addr(1);
        let b = addr(2);
        let c = addr(3);
        let pairs = vec![
            Pair { token0: a, token1: b, reserve0: U256::from(1000), reserve1: U256::from(2000) },
            Pair { token0: b, token1: c, reserve0: U256::from(5000), reserve1: U256::from(4000) },
        ];

        let trades = trade_exact_in(&pairs, U256::from(100), &[a], c, 3).unwrap();
        assert_eq!(trades.len(), 1);
        let trade = &trades[0];
        assert_eq!(trade.path, vec![a, b, c]);

        let leg1 = amount_out(U256::from(100), U256::from(1000), U256::from(2000)).unwrap();
        let expected = amount_out(leg1, U256::from(5000), U256::from(4000)).unwrap();
        assert_eq!(trade.output_amount, expected);
    }

    /// P5: `amountIn(amountOut(aIn, rIn, rOut), rIn, rOut) >= aIn`,
    /// differing by at most 1 wei.
    #[test]
    fn amount_in_out_round_trip_within_one_wei() {
        let reserve_in = U256::from(1_000_000u64);
        let reserve_out = U256::from(2_000_000u64);
        for input in [U256::from(1u64), U256::from(1000u64), U256::from(50_000u64)] {
            let out = amount_out(input, reserve_in, reserve_out).unwrap();
            let back = amount_in(out, reserve_in, reserve_out).unwrap();
            assert!(back >= input);
            assert!(back - input <= U256::from(1));
        }
    }

    #[test]
    fn pair_address_is_order_independent() {
        let factory = addr(0xaa);
        let token_a = addr(1);
        let token_b = addr(2);
        let init_code_hash = [0x55; 32];
        assert_eq!(
            pair_address(&factory, &token_a, &token_b, &init_code_hash),
            pair_address(&factory, &token_b, &token_a, &init_code_hash),
        );
    }

    #[test]
    fn best_trade_picks_max_output_for_exact_in() {
        let a = addr(1);
        let b = addr(2);
        let trades = vec![
            Trade { path: vec![a, b], input_amount: U256::from(100), output_amount: U256::from(190) },
            Trade { path: vec![a, b], input_amount: U256::from(100), output_amount: U256::from(200) },
        ];
        let best = best_trade(&trades, TradeSide::ExactIn).unwrap();
        assert_eq!(best.output_amount, U256::from(200));
    }

    #[test]
    fn erc20_source_requires_approve_before_swap() {
        let router = addr(0x99);
        let token_in = addr(1);
        let token_out = addr(2);
        let trade = Trade { path: vec![token_in, token_out], input_amount: U256::from(100), output_amount: U256::from(90) };

        let calls = build_swap_calls(
            &router,
            &trade,
            Leg::Erc20(token_in),
            Leg::Ether,
            TradeSide::ExactIn,
            false,
            U256::from(100),
            U256::from(90),
            addr(0x42),
            9_999_999_999,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].to, token_in);
        assert_eq!(calls[1].to, router);
    }
}
