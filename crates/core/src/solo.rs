use rehearse_transport::Track;

/// Gate gain for every track, in order.
///
/// A track is silenced when it is muted, or when some other track is soloed
/// and it is not. Mute wins over solo.
pub fn gate_gains(tracks: &[Track]) -> Vec<f32> {
    let any_solo = tracks.iter().any(|t| t.soloed);
    tracks
        .iter()
        .map(|t| {
            if t.muted || (any_solo && !t.soloed) {
                0.0
            } else {
                1.0
            }
        })
        .collect()
}
