//! `RedisStore` 比较并操作所用的 Lua 脚本

/// ARGV[1] 为条件个数，每个条件占两个参数：是否存在（"1"/"0"）和期望值。
/// KEYS 前面是条件键，其余为条件全部满足时删除的键
pub const COMPARE_AND_DELETE: &str = r#"
    local conditions = tonumber(ARGV[1])
    for i = 1, conditions do
        local current = redis.call('get', KEYS[i])
        if ARGV[2 * i] == '1' then
            if current ~= ARGV[2 * i + 1] then
                return 0
            end
        elseif current then
            return 0
        end
    end
    for i = conditions + 1, #KEYS do
        redis.call('del', KEYS[i])
    end
    return 1
"#;

pub const COMPARE_AND_SET_TTL: &str = r#"
    if redis.call('get', KEYS[1]) == ARGV[1] then
        return redis.call('pexpire', KEYS[1], tonumber(ARGV[2]))
    end
    return 0
"#;

/// KEYS[1] 为校验键，KEYS[2] 为写入键。
/// ARGV：是否存在、期望值、新值、兜底 TTL 毫秒数（0 表示不设置）、
/// KEYS[2] 当前值的下限（空串表示不检查）
pub const COMPARE_AND_SET: &str = r#"
    local current = redis.call('get', KEYS[1])
    if ARGV[1] == '1' then
        if current ~= ARGV[2] then
            return 0
        end
    elseif current then
        return 0
    end
    if ARGV[5] ~= '' then
        local existing = tonumber(redis.call('get', KEYS[2]))
        if not existing or existing <= tonumber(ARGV[5]) then
            return 0
        end
    end
    local ttl = tonumber(ARGV[4])
    if ttl > 0 then
        redis.call('set', KEYS[2], ARGV[3], 'PX', ttl)
        redis.call('pexpire', KEYS[1], ttl)
    else
        redis.call('set', KEYS[2], ARGV[3])
    end
    return 1
"#;
