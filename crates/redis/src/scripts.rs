//! Lua scripts giving each multi-step Redis operation the atomicity the
//! `Persisting`/`Shared` contract requires: a read-then-write pair executed
//! as one round trip can never observe a concurrent contender's write in
//! between.

/// Acquire (or idempotently re-acquire) the exclusive writer key.
///
/// `KEYS[1]` = writer key, `KEYS[2]` = readers sorted-set key.
/// `ARGV[1]` = token, `ARGV[2]` = TTL in milliseconds, `ARGV[3]` = now
/// (epoch milliseconds), used to prune expired readers before checking for
/// live ones.
///
/// Returns 1 if acquired, 0 if blocked by a different writer or by any live
/// reader.
pub const SAVE_EXCLUSIVE: &str = r"
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', ARGV[3])
if redis.call('ZCARD', KEYS[2]) > 0 then
    return 0
end
local current = redis.call('GET', KEYS[1])
if current == false or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
";

/// Acquire (or idempotently re-acquire) a shared reader slot.
///
/// `KEYS[1]` = writer key, `KEYS[2]` = readers sorted-set key.
/// `ARGV[1]` = token, `ARGV[2]` = new expiry (epoch milliseconds),
/// `ARGV[3]` = now (epoch milliseconds).
///
/// Returns 1 if acquired, 0 if blocked by a writer other than this token.
pub const SAVE_SHARED: &str = r"
local writer = redis.call('GET', KEYS[1])
if writer and writer ~= ARGV[1] then
    return 0
end
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', ARGV[3])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
";

/// Extend the deadline for whichever role `ARGV[1]` currently holds
/// (writer or reader).
///
/// `KEYS[1]` = writer key, `KEYS[2]` = readers sorted-set key.
/// `ARGV[1]` = token, `ARGV[2]` = TTL in milliseconds (applied to the
/// writer key), `ARGV[3]` = new expiry (epoch milliseconds, applied to a
/// reader's sorted-set score).
///
/// Returns 1 if extended, 0 if `ARGV[1]` holds neither role.
pub const PUT_OFF_EXPIRATION: &str = r"
local writer = redis.call('GET', KEYS[1])
if writer == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
local score = redis.call('ZSCORE', KEYS[2], ARGV[1])
if score then
    redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
    return 1
end
return 0
";

/// Release whichever role `ARGV[1]` currently holds. Always a no-op rather
/// than an error when `ARGV[1]` holds neither role, matching the common
/// store contract's "non-owner delete is a no-op".
///
/// `KEYS[1]` = writer key, `KEYS[2]` = readers sorted-set key.
/// `ARGV[1]` = token.
pub const DELETE: &str = r"
local writer = redis.call('GET', KEYS[1])
if writer == ARGV[1] then
    redis.call('DEL', KEYS[1])
end
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
";
